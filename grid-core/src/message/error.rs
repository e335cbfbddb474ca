use bincode::{Decode, Encode};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Encode, Decode)]
pub enum ErrorCode {
    WrongTarget,
    TargetNotMember,
    MemberNotActive,
    AuthenticationFailed,
    Serialization,
    UnknownOperation,
    Unknown,
}

impl ErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::WrongTarget | ErrorCode::TargetNotMember | ErrorCode::MemberNotActive
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

//! Wire-visible status vocabulary.
//!
//! Statuses travel as signed 32-bit values: non-negative values are
//! success conditions, negative values are error kinds. ADO plugins may
//! define their own codes in the `USER_BASE..` range; anything below
//! [`ERROR_BASE`] is reserved for the framework and clamped to `Fail`.

/// Floor for framework error codes. Codes below this are invalid.
pub const ERROR_BASE: i32 = -64;

/// First code of the ADO-defined (user) status range.
pub const USER_BASE: i32 = 1000;

/// Enumerated request status, shared by the backend interface, the
/// dispatcher, and the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation succeeded.
    Ok,
    /// Operation succeeded and created the object.
    OkCreated,
    /// Operation made progress and has more work to do.
    More,
    /// ADO-only: completion requests erasure of the invocation target.
    EraseTarget,
    /// Generic failure.
    Fail,
    /// Invalid argument or protocol misuse.
    Inval,
    /// Object is locked by another holder.
    Locked,
    /// Key does not exist.
    KeyNotFound,
    /// Value exceeds what the requested path can carry.
    TooLarge,
    /// Object already exists.
    AlreadyExists,
    /// Caller-provided space is too small.
    InsufficientSpace,
    /// Pool is still open (e.g. delete-by-name of an open pool).
    AlreadyOpen,
    /// Resource is busy; retry later.
    Busy,
    /// Operation not implemented.
    NotImpl,
    /// Operation not supported by this component.
    NotSupported,
    /// Offset or iterator ran past the end.
    OutOfBounds,
    /// A fixed capacity (e.g. deferred-lock table) was exhausted.
    MaxReached,
    /// Pool open/create failed.
    PoolError,
    /// ADO-defined status, `USER_BASE + n`.
    User(i32),
}

impl Status {
    /// True for non-negative (success) codes.
    pub fn is_ok(self) -> bool {
        self.to_i32() >= 0
    }

    /// Signed wire representation.
    pub fn to_i32(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::OkCreated => 1,
            Status::More => 2,
            Status::EraseTarget => 3,
            Status::Fail => -1,
            Status::Inval => -2,
            Status::Locked => -3,
            Status::KeyNotFound => -4,
            Status::TooLarge => -5,
            Status::AlreadyExists => -6,
            Status::InsufficientSpace => -7,
            Status::AlreadyOpen => -8,
            Status::Busy => -9,
            Status::NotImpl => -10,
            Status::NotSupported => -11,
            Status::OutOfBounds => -12,
            Status::MaxReached => -13,
            Status::PoolError => -14,
            Status::User(n) => n,
        }
    }

    /// Decode a wire status. Codes outside the known and user ranges
    /// collapse to `Fail`, mirroring how completions from ADO plugins
    /// are sanitized.
    pub fn from_i32(v: i32) -> Status {
        match v {
            0 => Status::Ok,
            1 => Status::OkCreated,
            2 => Status::More,
            3 => Status::EraseTarget,
            -1 => Status::Fail,
            -2 => Status::Inval,
            -3 => Status::Locked,
            -4 => Status::KeyNotFound,
            -5 => Status::TooLarge,
            -6 => Status::AlreadyExists,
            -7 => Status::InsufficientSpace,
            -8 => Status::AlreadyOpen,
            -9 => Status::Busy,
            -10 => Status::NotImpl,
            -11 => Status::NotSupported,
            -12 => Status::OutOfBounds,
            -13 => Status::MaxReached,
            -14 => Status::PoolError,
            n if n >= USER_BASE => Status::User(n),
            _ => Status::Fail,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::User(n) => write!(f, "USER({})", n - USER_BASE),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        let all = [
            Status::Ok,
            Status::OkCreated,
            Status::More,
            Status::EraseTarget,
            Status::Fail,
            Status::Inval,
            Status::Locked,
            Status::KeyNotFound,
            Status::TooLarge,
            Status::AlreadyExists,
            Status::InsufficientSpace,
            Status::AlreadyOpen,
            Status::Busy,
            Status::NotImpl,
            Status::NotSupported,
            Status::OutOfBounds,
            Status::MaxReached,
            Status::PoolError,
            Status::User(USER_BASE + 7),
        ];
        for s in all {
            assert_eq!(Status::from_i32(s.to_i32()), s);
        }
    }

    #[test]
    fn test_status_out_of_range_collapses_to_fail() {
        assert_eq!(Status::from_i32(ERROR_BASE - 1), Status::Fail);
        assert_eq!(Status::from_i32(-40), Status::Fail);
    }

    #[test]
    fn test_status_is_ok() {
        assert!(Status::Ok.is_ok());
        assert!(Status::OkCreated.is_ok());
        assert!(!Status::KeyNotFound.is_ok());
    }
}

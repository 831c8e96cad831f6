use thiserror::Error;

/// Broad grouping of [`VmError`]s.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    Allocation,
    Stack,
    Dispatch,
    Resource,
    Invariant,
    /// not a failure, the caller has to hand control to someone else
    Control,
}

/// Every result code the core can produce.
///
/// Control signals travel through the same channel as real errors so a
/// native operator can return them with `?` like anything else. Use
/// [`VmError::is_control_signal`] before treating a value as a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("VMerror")]
    VmFull,
    #[error("rangecheck")]
    RangeCheck,
    #[error("limitcheck")]
    LimitCheck,

    #[error("stackoverflow")]
    StackOverflow,
    #[error("stackunderflow")]
    StackUnderflow,
    #[error("execstackoverflow")]
    ExecStackOverflow,
    #[error("dictstackoverflow")]
    DictStackOverflow,
    #[error("dictstackunderflow")]
    DictStackUnderflow,
    #[error("unmatchedmark")]
    UnmatchedMark,

    #[error("typecheck")]
    TypeCheck,
    #[error("unregistered")]
    Unregistered,
    #[error("invalid operator signature")]
    InvalidSignature,

    #[error("invalidfileaccess")]
    InvalidFileAccess,
    #[error("invalidaccess")]
    InvalidAccess,
    #[error("invalidrestore")]
    InvalidRestore,
    #[error("invalidcontext")]
    InvalidContext,

    #[error("arena is not initialized")]
    Uninitialized,
    #[error("entity {0} does not exist")]
    InvalidEntity(u32),

    #[error("context switch")]
    ContextSwitch,
    #[error("blocked on i/o")]
    BlockedIo,
    #[error("yield to caller")]
    YieldToCaller,
}

pub type OpResult = Result<(), VmError>;

impl VmError {
    pub fn class(&self) -> ErrorClass {
        use VmError::*;
        match self {
            VmFull | RangeCheck | LimitCheck => ErrorClass::Allocation,
            StackOverflow | StackUnderflow | ExecStackOverflow | DictStackOverflow
            | DictStackUnderflow | UnmatchedMark => ErrorClass::Stack,
            TypeCheck | Unregistered | InvalidSignature => ErrorClass::Dispatch,
            InvalidFileAccess | InvalidAccess | InvalidRestore | InvalidContext => {
                ErrorClass::Resource
            }
            Uninitialized | InvalidEntity(_) => ErrorClass::Invariant,
            ContextSwitch | BlockedIo | YieldToCaller => ErrorClass::Control,
        }
    }

    #[inline]
    pub fn is_control_signal(&self) -> bool {
        self.class() == ErrorClass::Control
    }

    /// PostScript name of the error, as pushed by an error handler.
    pub fn name(&self) -> &'static str {
        use VmError::*;
        match self {
            VmFull => "VMerror",
            RangeCheck => "rangecheck",
            LimitCheck => "limitcheck",
            StackOverflow => "stackoverflow",
            StackUnderflow => "stackunderflow",
            ExecStackOverflow => "execstackoverflow",
            DictStackOverflow => "dictstackoverflow",
            DictStackUnderflow => "dictstackunderflow",
            UnmatchedMark => "unmatchedmark",
            TypeCheck => "typecheck",
            Unregistered => "unregistered",
            InvalidSignature => "invalidsignature",
            InvalidFileAccess => "invalidfileaccess",
            InvalidAccess => "invalidaccess",
            InvalidRestore => "invalidrestore",
            InvalidContext => "invalidcontext",
            Uninitialized | InvalidEntity(_) => "VMerror",
            ContextSwitch => "contextswitch",
            BlockedIo => "blockedio",
            YieldToCaller => "yield",
        }
    }
}

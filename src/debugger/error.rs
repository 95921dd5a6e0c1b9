use crate::debugger::ptid::Ptid;
use crate::debugger::CoreAddr;

/// Soft failure of a single partial transfer. Lower layers may still satisfy the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("cannot access memory at address {0:#x}")]
    Inaccessible(CoreAddr),
    #[error("memory at address {0:#x} is not writable")]
    NotWritable(CoreAddr),
    #[error("cannot write to flash memory at address {0:#x}")]
    Flash(CoreAddr),
    #[error("zero length transfer reported as success")]
    ZeroLength,
    #[error("object is not supported by this layer")]
    UnsupportedObject,
    #[error("{0}")]
    Io(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error("the program is already running")]
    AlreadyRunning,
    #[error("the program is not being run")]
    NoProcess,
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("config: {0}")]
    Config(String),

    // --------------------------------- debugger entity not found----------------------------------
    #[error("no thread selected")]
    NoThreadSelected,
    #[error("unknown thread {0}")]
    ThreadNotFound(Ptid),
    #[error("unknown register {0:?}")]
    RegisterNameNotFound(String),
    #[error("value of register {0:?} is not available")]
    RegisterUnavailable(String),
    #[error("no breakpoint number {0}")]
    BreakpointNotFound(u32),
    #[error("no bookmark number {0}")]
    BookmarkNotFound(u32),
    #[error("no memory region number {0}")]
    RegionNotFound(u32),
    #[error("no inferior number {0}")]
    InferiorNotFound(u32),
    #[error("no symbol information for {0:?}")]
    SymbolNotFound(String),
    #[error("no line information for address {0:#x}")]
    NoLineInformation(CoreAddr),

    // --------------------------------- execution control errors ----------------------------------
    #[error("\"finish\" not meaningful in the outermost frame")]
    OutermostFrame,
    #[error("cannot find bounds of current function")]
    NoFunctionBounds,
    #[error("already in reverse mode")]
    AlreadyReverse,
    #[error("memory region [{0:#x}, {1:#x}) overlaps an existing region")]
    OverlappingRegion(CoreAddr, CoreAddr),
    #[error("unwind: {0}")]
    Unwind(String),

    // --------------------------------- backend errors --------------------------------------------
    #[error("target does not support {0}")]
    Unsupported(&'static str),
    #[error("{layer}: {reason}")]
    Refused { layer: &'static str, reason: String },
    #[error(transparent)]
    Transfer(#[from] TransferError),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),

    // --------------------------------- parsing errors --------------------------------------------
    #[error("dwarf file parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    // --------------------------------- hook errors -----------------------------------------------
    #[error("hook: {0}")]
    Hook(anyhow::Error),

    // --------------------------------- internal errors -------------------------------------------
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Return true if the debugger state is broken and the session must be aborted.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::AlreadyRunning => false,
            Error::NoProcess => false,
            Error::IO(_) => false,
            Error::InvalidArgument(_) => false,
            Error::Config(_) => false,
            Error::NoThreadSelected => false,
            Error::ThreadNotFound(_) => false,
            Error::RegisterNameNotFound(_) => false,
            Error::RegisterUnavailable(_) => false,
            Error::BreakpointNotFound(_) => false,
            Error::BookmarkNotFound(_) => false,
            Error::RegionNotFound(_) => false,
            Error::InferiorNotFound(_) => false,
            Error::SymbolNotFound(_) => false,
            Error::NoLineInformation(_) => false,
            Error::OutermostFrame => false,
            Error::NoFunctionBounds => false,
            Error::AlreadyReverse => false,
            Error::OverlappingRegion(_, _) => false,
            Error::Unwind(_) => false,
            Error::Unsupported(_) => false,
            Error::Refused { .. } => false,
            Error::Transfer(_) => false,
            Error::Waitpid(_) => false,
            Error::Ptrace(_) => false,
            Error::Hook(_) => false,

            // currently fatal errors
            Error::Syscall(_, _) => true,
            Error::DwarfParsing(_) => true,
            Error::ObjParsing(_) => true,
            Error::Internal(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}

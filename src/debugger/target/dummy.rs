use crate::debugger::error::{Error, TransferError};
use crate::debugger::ptid::Ptid;
use crate::debugger::register::RegisterCache;
use crate::debugger::target::{
    Beneath, BreakpointInsertion, BreakpointSite, ResumeRequest, Stratum, Target, TargetObject,
    TargetSection, Transfer, TransferRequest, WaitOptions, WaitStatus,
};
use crate::debugger::CoreAddr;
use std::path::Path;

/// Permanent floor of every stack. Terminates delegation of all operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyTarget;

impl Target for DummyTarget {
    fn shortname(&self) -> &'static str {
        "None"
    }

    fn longname(&self) -> String {
        "None".to_string()
    }

    fn stratum(&self) -> Stratum {
        Stratum::Dummy
    }

    fn xfer_partial(
        &mut self,
        _: Beneath<'_>,
        _: TargetObject,
        offset: CoreAddr,
        req: TransferRequest<'_>,
    ) -> Result<Transfer, Error> {
        if req.is_empty() {
            return Ok(Transfer::Eof);
        }
        Ok(Transfer::Io(TransferError::Inaccessible(offset)))
    }

    fn has_memory(&self, _: Beneath<'_>) -> bool {
        false
    }

    fn has_execution(&self, _: Beneath<'_>) -> bool {
        false
    }

    fn section_table(&self, _: Beneath<'_>) -> Vec<TargetSection> {
        vec![]
    }

    fn fetch_registers(&mut self, _: Beneath<'_>, _: Ptid, _: &mut RegisterCache) -> Result<(), Error> {
        Err(Error::NoProcess)
    }

    fn store_registers(&mut self, _: Beneath<'_>, _: Ptid, _: &RegisterCache) -> Result<(), Error> {
        Err(Error::NoProcess)
    }

    fn resume(&mut self, _: Beneath<'_>, _: ResumeRequest) -> Result<(), Error> {
        Err(Error::NoProcess)
    }

    fn wait(
        &mut self,
        _: Beneath<'_>,
        _: Ptid,
        _: WaitOptions,
    ) -> Result<Option<(Ptid, WaitStatus)>, Error> {
        Err(Error::NoProcess)
    }

    fn stop(&mut self, _: Beneath<'_>, _: Ptid) -> Result<(), Error> {
        Err(Error::NoProcess)
    }

    fn create_inferior(&mut self, _: Beneath<'_>, _: &Path, _: &[String]) -> Result<Ptid, Error> {
        Err(Error::Unsupported("running programs"))
    }

    fn attach(&mut self, _: Beneath<'_>, _: i32) -> Result<Ptid, Error> {
        Err(Error::Unsupported("attaching to processes"))
    }

    fn detach(&mut self, _: Beneath<'_>, _: i32) -> Result<(), Error> {
        Err(Error::NoProcess)
    }

    fn kill(&mut self, _: Beneath<'_>, _: i32) -> Result<(), Error> {
        Err(Error::NoProcess)
    }

    fn mourn_inferior(&mut self, _: Beneath<'_>, _: i32) {}

    fn thread_alive(&self, _: Beneath<'_>, _: Ptid) -> bool {
        false
    }

    fn update_thread_list(&mut self, _: Beneath<'_>, _: &mut Vec<Ptid>) -> Result<(), Error> {
        Ok(())
    }

    fn pid_to_str(&self, _: Beneath<'_>, ptid: Ptid) -> String {
        ptid.to_string()
    }

    fn insert_breakpoint(
        &mut self,
        _: Beneath<'_>,
        _: &BreakpointSite,
    ) -> Result<BreakpointInsertion, Error> {
        Ok(BreakpointInsertion::UseMemory)
    }

    fn remove_breakpoint(
        &mut self,
        _: Beneath<'_>,
        _: &BreakpointSite,
    ) -> Result<BreakpointInsertion, Error> {
        Ok(BreakpointInsertion::UseMemory)
    }

    fn stopped_by_sw_breakpoint(&self, _: Beneath<'_>, _: Ptid) -> bool {
        false
    }

    fn can_execute_reverse(&self, _: Beneath<'_>) -> bool {
        false
    }

    fn is_replaying(&self, _: Beneath<'_>) -> bool {
        false
    }

    fn get_bookmark(&mut self, _: Beneath<'_>, _: Ptid) -> Result<Vec<u8>, Error> {
        Err(Error::Unsupported("bookmarks"))
    }

    fn goto_bookmark(&mut self, _: Beneath<'_>, _: &[u8], _: Ptid) -> Result<(), Error> {
        Err(Error::Unsupported("bookmarks"))
    }
}

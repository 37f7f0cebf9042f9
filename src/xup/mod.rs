//! libxup, the module that speaks to the X server's xrdp driver.

pub mod callbacks;
pub mod ffi;

use anyhow::{Context, Result, bail};
use std::ffi::{CString, c_char, c_int, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::{debug, error, info};
use xrdp_local_core::ModuleError;
use xrdp_local_core::input::ModuleMessage;
use xrdp_local_core::probe::{self, Capability, CapabilityOverride, ProbeInput};
use xrdp_local_core::worker::{ProtocolModule, TransportStatus};

use crate::dl::{self, Library};
use callbacks::CallbackContext;
use ffi::{ClientInfo, Tbus, XupMod};

type ModInit = unsafe extern "C" fn() -> *mut XupMod;
type ModExit = unsafe extern "C" fn(*mut XupMod) -> c_int;

fn entry<T>(slot: Option<T>, name: &'static str) -> Result<T, ModuleError> {
    slot.ok_or(ModuleError::MissingEntryPoint(name))
}

fn check(call: &'static str, code: c_int) -> Result<(), ModuleError> {
    match code {
        0 => Ok(()),
        code => Err(ModuleError::Call { call, code }),
    }
}

/// A loaded and initialized module instance.
///
/// Not re-entrant: after [`XupModule::connect`] every call goes through
/// the transport worker's lock.
pub struct XupModule {
    module: *mut XupMod,
    mod_exit: ModExit,
    /// Any address inside the module image, for segment lookup.
    anchor: *const c_void,
    library: Library,
    context: Option<Box<CallbackContext>>,
}

// SAFETY: the table is only touched by one thread at a time, under the
// communication lock once the worker runs.
unsafe impl Send for XupModule {}

impl XupModule {
    pub fn load(path: &Path) -> Result<Self> {
        let library = Library::open(path).context("Failed to load protocol module")?;
        // SAFETY: prototypes from xup.h.
        let (mod_init, mod_exit) = unsafe {
            (
                library.symbol::<ModInit>("mod_init")?,
                library.symbol::<ModExit>("mod_exit")?,
            )
        };
        // SAFETY: no preconditions.
        let module = unsafe { mod_init() };
        if module.is_null() {
            bail!("mod_init in {:?} returned null", path);
        }
        // SAFETY: mod_init returned a live table.
        let (size, version) = unsafe { ((*module).size, (*module).version) };
        info!("Loaded {:?} (table size {}, version {})", path, size, version);
        Ok(Self {
            module,
            mod_exit,
            anchor: mod_init as *const c_void,
            library,
            context: None,
        })
    }

    fn table(&self) -> &XupMod {
        // SAFETY: valid from load until drop.
        unsafe { &*self.module }
    }

    /// Install the host callbacks and the context they reach through the
    /// table's owner pointer.
    pub fn install(&mut self, context: CallbackContext) {
        let context = Box::new(context);
        // SAFETY: no other thread uses the table yet; the context box is
        // kept until after mod_exit.
        unsafe {
            (*self.module).wm = &*context as *const CallbackContext as Tbus;
            (*self.module).server = callbacks::server_fns();
        }
        self.context = Some(context);
        debug!("Server callbacks installed");
    }

    pub fn start(&mut self, width: u32, height: u32) -> Result<()> {
        let start = entry(self.table().mod_start, "mod_start")?;
        // SAFETY: live table.
        let code = unsafe { start(self.module, width as c_int, height as c_int, 32) };
        check("mod_start", code).with_context(|| format!("Failed to start module at {}x{}", width, height))?;
        debug!("Module started at {}x{}", width, height);
        Ok(())
    }

    fn set_param(&mut self, name: &str, value: *const c_char) -> Result<()> {
        let set = entry(self.table().mod_set_param, "mod_set_param")?;
        let c_name = CString::new(name)?;
        // SAFETY: the module copies the value before returning.
        let code = unsafe { set(self.module, c_name.as_ptr(), value) };
        check("mod_set_param", code).with_context(|| format!("Failed to set {}", name))?;
        Ok(())
    }

    pub fn set_client_info(&mut self, info: &ClientInfo) -> Result<()> {
        self.set_param("client_info", info as *const ClientInfo as *const c_char)
    }

    /// Point the module at the X server driver's socket.
    pub fn set_port(&mut self, socket: &Path) -> Result<()> {
        let value = CString::new(socket.as_os_str().as_bytes())
            .with_context(|| format!("Socket path {:?} contains a NUL byte", socket))?;
        self.set_param("port", value.as_ptr())
    }

    pub fn connect(&mut self) -> Result<()> {
        let connect = entry(self.table().mod_connect, "mod_connect")?;
        // SAFETY: live table, started and configured.
        let code = unsafe { connect(self.module) };
        check("mod_connect", code).context("Failed to connect to the X server driver")?;
        info!("Connected to the X server driver");
        Ok(())
    }

    /// Decide whether the module can be asked for accelerated buffers.
    pub fn capability(&self, setting: CapabilityOverride) -> Capability {
        let image = dl::image_containing(self.anchor);
        let module = self.module;
        probe::decide(
            setting,
            ProbeInput {
                table_size: self.table().size.max(0) as usize,
                slot_end: ffi::DMA_BUF_REQUEST_SLOT_END,
                // SAFETY: only read once the table is known to reach the slot.
                read_slot: || unsafe { ffi::dma_buf_request_slot(module) },
                image: &image,
            },
        )
    }

    pub fn path(&self) -> &Path {
        self.library.path()
    }
}

impl ProtocolModule for XupModule {
    fn check_transport(&mut self) -> TransportStatus {
        let Some(check_wait) = self.table().mod_check_wait_objs else {
            error!("{}", ModuleError::MissingEntryPoint("mod_check_wait_objs"));
            return TransportStatus::Closed;
        };
        // SAFETY: live table; the caller holds the communication lock.
        match unsafe { check_wait(self.module) } {
            0 => TransportStatus::Open,
            code => {
                debug!("mod_check_wait_objs returned {}", code);
                TransportStatus::Closed
            }
        }
    }

    fn send_event(&mut self, message: &ModuleMessage) -> Result<(), ModuleError> {
        let event = entry(self.table().mod_event, "mod_event")?;
        // SAFETY: live table; the caller holds the communication lock.
        let code = unsafe {
            event(
                self.module,
                message.msg,
                message.param1 as Tbus,
                message.param2 as Tbus,
                message.param3 as Tbus,
                message.param4 as Tbus,
            )
        };
        check("mod_event", code)
    }

    fn request_accel(&mut self) -> Result<(), ModuleError> {
        let request = entry(self.table().mod_dma_buf_request, "mod_dma_buf_request")?;
        // SAFETY: only requested after the capability probe accepted the slot.
        let code = unsafe { request(self.module) };
        check("mod_dma_buf_request", code)
    }
}

impl Drop for XupModule {
    fn drop(&mut self) {
        // SAFETY: the worker has been joined; nothing else holds the table.
        let code = unsafe { (self.mod_exit)(self.module) };
        if code != 0 {
            error!("mod_exit returned {}", code);
        }
        debug!("Module {:?} exited", self.library.path());
    }
}

//! In-process CPU-class device.
//!
//! [`HostDevice`] runs every kernel of the morphology program directly on
//! the host with rayon. Commands execute at enqueue time, so the queue is
//! trivially in-order and every returned [`Event`] is already complete.
//!
//! Program build validates the program text and binds each entry point it
//! declares to the native implementation of the same name; a program that
//! is malformed or lacks an entry point fails to build with a compiler-style
//! log, just like a real driver.
//!
//! Every dispatch is recorded (kernel, buffers, geometry) and can be
//! inspected with [`HostDevice::dispatch_log`].

use std::collections::BTreeSet;
use std::sync::{Mutex, OnceLock, RwLock};

use tracing::{debug, trace};

use super::{
    AsAny, Clock, Command, ComputeDevice, DeviceBuffer, DeviceClass, DeviceInfo, DeviceMemory, Event, MemAccess,
    NdRange, PendingRead, missing_entry_points, next_buffer_id, status,
};
use crate::kernels::{KernelLaunch, KernelName, reference};
use crate::{ComputeError, ComputeResult, ELEMENT_SIZE, Pixel};

static SYSTEM_MEMORY: OnceLock<u64> = OnceLock::new();

/// Total system RAM in bytes.
fn system_memory() -> u64 {
    *SYSTEM_MEMORY.get_or_init(|| {
        sys_info::mem_info()
            .map(|m| m.total * 1024) // KB to bytes
            .unwrap_or(8 * 1024 * 1024 * 1024) // 8 GB fallback
    })
}

// =============================================================================
// HostBuffer
// =============================================================================

/// Host memory posing as a device allocation.
#[derive(Debug)]
pub struct HostBuffer {
    id: u64,
    size_bytes: usize,
    access: MemAccess,
    data: RwLock<Vec<Pixel>>,
}

impl HostBuffer {
    fn new(size_bytes: usize, access: MemAccess, data: Vec<Pixel>) -> Self {
        Self {
            id: next_buffer_id(),
            size_bytes,
            access,
            data: RwLock::new(data),
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> ComputeResult<Vec<Pixel>> {
        Ok(self.data.read().map_err(|_| poisoned())?.clone())
    }
}

impl AsAny for HostBuffer {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl DeviceMemory for HostBuffer {
    fn id(&self) -> u64 {
        self.id
    }

    fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    fn access(&self) -> MemAccess {
        self.access
    }
}

fn poisoned() -> ComputeError {
    ComputeError::device(status::OUT_OF_RESOURCES, "host buffer lock poisoned")
}

fn host_buffer(buf: &DeviceBuffer) -> ComputeResult<&HostBuffer> {
    buf.as_any().downcast_ref::<HostBuffer>().ok_or_else(|| {
        ComputeError::device(
            status::INVALID_MEM_OBJECT,
            format!("buffer {} does not belong to the host device", buf.id()),
        )
    })
}

// =============================================================================
// Dispatch log
// =============================================================================

/// One recorded kernel dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub kernel: KernelName,
    /// Id of the buffer bound as input.
    pub input: u64,
    /// Id of the buffer bound as output.
    pub output: u64,
    pub global: NdRange,
    pub local: NdRange,
    pub local_mem_bytes: usize,
    /// `naivemorph` target sum.
    pub target: Option<i32>,
}

// =============================================================================
// HostDevice
// =============================================================================

/// In-process device executing the morphology program with rayon.
pub struct HostDevice {
    info: DeviceInfo,
    entry_points: Option<BTreeSet<KernelName>>,
    clock: Clock,
    log: Mutex<Vec<DispatchRecord>>,
}

impl HostDevice {
    /// CPU-class host device.
    pub fn new() -> Self {
        Self::emulating(DeviceClass::Cpu)
    }

    /// Host device reporting `class`.
    ///
    /// With [`DeviceClass::Gpu`] the device advertises parallel-device
    /// limits, so the session applies its parallel dispatch policy (64-lane
    /// packed kernels, multi-item work-groups) while still executing on the
    /// host.
    pub fn emulating(class: DeviceClass) -> Self {
        let threads = rayon::current_num_threads();
        let global_mem_bytes = system_memory();
        let info = match class {
            DeviceClass::Gpu => DeviceInfo {
                name: format!("mmorph host, parallel emulation ({threads} threads)"),
                backend: "host".into(),
                class: DeviceClass::Gpu,
                compute_units: threads,
                max_work_group_size: 1024,
                max_work_item_sizes: [1024, 1024],
                local_mem_bytes: 48 * 1024,
                max_alloc_bytes: (global_mem_bytes / 4) as usize,
                global_mem_bytes,
            },
            DeviceClass::Cpu | DeviceClass::Any => DeviceInfo {
                name: format!("mmorph host ({threads} threads)"),
                backend: "host".into(),
                class: DeviceClass::Cpu,
                compute_units: threads,
                max_work_group_size: 8192,
                max_work_item_sizes: [8192, 8192],
                local_mem_bytes: 32 * 1024,
                max_alloc_bytes: (global_mem_bytes / 4) as usize,
                global_mem_bytes,
            },
        };
        Self {
            info,
            entry_points: None,
            clock: Clock::new(),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Every dispatch enqueued so far, oldest first.
    pub fn dispatch_log(&self) -> Vec<DispatchRecord> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Forgets recorded dispatches.
    pub fn clear_dispatch_log(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }

    fn check_size(&self, size_bytes: usize) -> ComputeResult<()> {
        if size_bytes == 0 || size_bytes > self.info.max_alloc_bytes {
            return Err(ComputeError::device(
                status::INVALID_BUFFER_SIZE,
                format!(
                    "{size_bytes} bytes outside 1..={} bytes",
                    self.info.max_alloc_bytes
                ),
            ));
        }
        Ok(())
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AsAny for HostDevice {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl ComputeDevice for HostDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn build_program(&mut self, source: &str) -> ComputeResult<()> {
        let found = scan_entry_points(source).map_err(|log| ComputeError::ProgramBuild { log })?;
        let missing = missing_entry_points(&found);
        if !missing.is_empty() {
            let log = missing
                .iter()
                .map(|name| format!("error: entry point `{name}` not found in program"))
                .collect::<Vec<_>>()
                .join("\n");
            return Err(ComputeError::ProgramBuild { log });
        }

        let bound: BTreeSet<KernelName> = KernelName::ALL.into_iter().collect();
        debug!(device = %self.info.name, entry_points = bound.len(), "Program built");
        self.entry_points = Some(bound);
        Ok(())
    }

    fn has_program(&self) -> bool {
        self.entry_points.is_some()
    }

    fn create_buffer(&self, size_bytes: usize, access: MemAccess) -> ComputeResult<DeviceBuffer> {
        self.check_size(size_bytes)?;
        let buf = HostBuffer::new(size_bytes, access, vec![0; size_bytes.div_ceil(ELEMENT_SIZE)]);
        trace!(id = buf.id, size_bytes, "Host buffer allocated");
        Ok(std::sync::Arc::new(buf))
    }

    fn create_buffer_init(&self, data: &[Pixel], access: MemAccess) -> ComputeResult<DeviceBuffer> {
        let size_bytes = std::mem::size_of_val(data);
        self.check_size(size_bytes)?;
        Ok(std::sync::Arc::new(HostBuffer::new(size_bytes, access, data.to_vec())))
    }

    fn enqueue_write(&self, dst: &DeviceBuffer, data: &[Pixel]) -> ComputeResult<Event> {
        let buf = host_buffer(dst)?;
        let bytes = std::mem::size_of_val(data);
        if bytes > buf.size_bytes {
            return Err(ComputeError::device(
                status::INVALID_VALUE,
                format!("write of {bytes} bytes into a {}-byte buffer", buf.size_bytes),
            ));
        }
        let start = self.clock.now_ns();
        buf.data.write().map_err(|_| poisoned())?[..data.len()].copy_from_slice(data);
        Ok(Event::completed(Command::Write, start, self.clock.now_ns()))
    }

    fn enqueue_read(&self, src: &DeviceBuffer, len: usize) -> ComputeResult<PendingRead> {
        let buf = host_buffer(src)?;
        if len * ELEMENT_SIZE > buf.size_bytes {
            return Err(ComputeError::device(
                status::INVALID_VALUE,
                format!("read of {} bytes from a {}-byte buffer", len * ELEMENT_SIZE, buf.size_bytes),
            ));
        }
        let start = self.clock.now_ns();
        let data = buf.data.read().map_err(|_| poisoned())?[..len].to_vec();
        let event = Event::completed(Command::Read, start, self.clock.now_ns());
        Ok(PendingRead::ready(event, data))
    }

    fn enqueue_kernel(&self, launch: &KernelLaunch<'_>) -> ComputeResult<Event> {
        let name = launch.kernel.name();
        let entry_points = self.entry_points.as_ref().ok_or_else(|| {
            ComputeError::device(status::INVALID_PROGRAM_EXECUTABLE, "no program built")
        })?;
        if !entry_points.contains(&name) {
            return Err(ComputeError::device(
                status::INVALID_KERNEL_NAME,
                format!("program has no entry point `{name}`"),
            ));
        }
        launch.validate(&self.info)?;

        let input = host_buffer(launch.input)?;
        let output = host_buffer(launch.output)?;
        let se = launch.kernel.se_buffer().map(host_buffer).transpose()?;

        let start = self.clock.now_ns();
        {
            let src = input.data.read().map_err(|_| poisoned())?;
            let mut dst = output.data.write().map_err(|_| poisoned())?;
            let se_guard = match se {
                Some(se) => Some(se.data.read().map_err(|_| poisoned())?),
                None => None,
            };
            let se_data: &[Pixel] = se_guard.as_deref().map(Vec::as_slice).unwrap_or_default();
            reference::execute(
                launch.kernel,
                &src,
                &mut dst,
                se_data,
                launch.nrows as usize,
                launch.ncols as usize,
                launch.global,
            );
        }
        let end = self.clock.now_ns();

        if let Ok(mut log) = self.log.lock() {
            log.push(DispatchRecord {
                kernel: name,
                input: input.id,
                output: output.id,
                global: launch.global,
                local: launch.local,
                local_mem_bytes: launch.kernel.local_mem_bytes(),
                target: launch.kernel.target(),
            });
        }
        Ok(Event::completed(Command::Kernel(name), start, end))
    }

    fn flush(&self) -> ComputeResult<()> {
        Ok(())
    }

    fn finish(&self) -> ComputeResult<()> {
        Ok(())
    }
}

/// Entry point names declared by `@compute` functions in a WGSL program.
///
/// Also rejects programs whose braces do not balance, reporting the line.
fn scan_entry_points(source: &str) -> Result<Vec<&str>, String> {
    let mut depth = 0i64;
    for (line_no, line) in source.lines().enumerate() {
        let code = line.split("//").next().unwrap_or_default();
        for ch in code.chars() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(format!("program:{}: error: unexpected `}}`", line_no + 1));
                    }
                }
                _ => {}
            }
        }
    }
    if depth != 0 {
        return Err(format!("program: error: unexpected end of input, {depth} unclosed `{{`"));
    }

    let mut found = Vec::new();
    for chunk in source.split("@compute").skip(1) {
        let Some(pos) = chunk.find("fn ") else {
            continue;
        };
        let rest = chunk[pos + 3..].trim_start();
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if end > 0 {
            found.push(&rest[..end]);
        }
    }
    Ok(found)
}

//! wgpu device implementation.
//!
//! Runs the WGSL morphology program through a wgpu adapter (Vulkan, Metal,
//! DX12 or GL). Adapters reporting [`wgpu::DeviceType::Cpu`] become
//! CPU-class devices; everything else is parallel-class.
//!
//! Pipelines are compiled lazily per `(kernel, local size)` because the
//! work-group size is a pipeline override constant. Submissions return
//! immediately; events resolve by polling the device for their submission.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use bytemuck::{Pod, Zeroable};
use tracing::{debug, error, info};
use wgpu::util::DeviceExt;

use super::{
    AsAny, Clock, Command, ComputeDevice, DeviceBuffer, DeviceClass, DeviceInfo, DeviceMemory, Event, MemAccess,
    NdRange, PendingRead, Signal, next_buffer_id, status,
};
use crate::kernels::{Kernel, KernelLaunch, KernelName};
use crate::{ComputeError, ComputeResult, ELEMENT_SIZE, Pixel};

// =============================================================================
// Uniform Buffers
// =============================================================================

/// Kernel parameters: `[nrows, ncols, gx, gy, a, b, c, d]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ParamsUniform {
    nrows: i32,
    ncols: i32,
    gx: u32,
    gy: u32,
    args: [i32; 4],
}

/// Kernel-specific `a..d` slots of [`ParamsUniform`].
fn kernel_args(kernel: &Kernel) -> [i32; 4] {
    match kernel {
        Kernel::Unbitmap => [0; 4],
        Kernel::Binarize { threshold, min, max } => [*threshold, *min, *max, 0],
        Kernel::BitmappedBinarize {
            threshold,
            below,
            above,
            ..
        } => [*threshold, *below, *above, 0],
        Kernel::NaiveMorph { se, target, .. } => [se.rowrad as i32, se.colrad as i32, se.count as i32, *target],
        Kernel::BitmappedDilationH { colrad } | Kernel::BitmappedErosionH { colrad } => [*colrad as i32, 0, 0, 0],
        Kernel::BitmappedDilationV { rowrad } | Kernel::BitmappedErosionV { rowrad } => [*rowrad as i32, 0, 0, 0],
    }
}

// =============================================================================
// WgpuBuffer
// =============================================================================

/// Storage buffer on a wgpu device.
#[derive(Debug)]
pub struct WgpuBuffer {
    id: u64,
    size_bytes: usize,
    access: MemAccess,
    buffer: wgpu::Buffer,
}

impl AsAny for WgpuBuffer {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl DeviceMemory for WgpuBuffer {
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

fn wgpu_buffer(buf: &DeviceBuffer) -> ComputeResult<&WgpuBuffer> {
    buf.as_any().downcast_ref::<WgpuBuffer>().ok_or_else(|| {
        ComputeError::device(
            status::INVALID_MEM_OBJECT,
            format!("buffer {} does not belong to this wgpu device", buf.id()),
        )
    })
}

// =============================================================================
// Completion
// =============================================================================

struct SubmissionSignal {
    device: Arc<wgpu::Device>,
    index: wgpu::SubmissionIndex,
    clock: Clock,
    start: u64,
    end: Arc<AtomicU64>,
    done: Arc<AtomicBool>,
}

impl SubmissionSignal {
    fn mark_done(&self) {
        if !self.done.load(Ordering::Acquire) {
            self.end.store(self.clock.now_ns(), Ordering::Release);
            self.done.store(true, Ordering::Release);
        }
    }
}

impl Signal for SubmissionSignal {
    fn wait(&self) -> ComputeResult<()> {
        let _ = self
            .device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(self.index.clone()));
        // The work-done callback may run after the poll returns.
        self.mark_done();
        Ok(())
    }

    fn is_complete(&self) -> bool {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        self.done.load(Ordering::Acquire)
    }

    fn timestamps(&self) -> Option<(u64, u64)> {
        self.done
            .load(Ordering::Acquire)
            .then(|| (self.start, self.end.load(Ordering::Acquire)))
    }
}

// =============================================================================
// WgpuDevice
// =============================================================================

type PipelineKey = (KernelName, u32, u32);

/// wgpu-backed compute device.
pub struct WgpuDevice {
    info: DeviceInfo,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    limits: wgpu::Limits,
    module: Option<wgpu::ShaderModule>,
    pipelines: Mutex<HashMap<PipelineKey, Arc<wgpu::ComputePipeline>>>,
    clock: Clock,
}

impl WgpuDevice {
    fn instance() -> wgpu::Instance {
        wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        })
    }

    /// Check if any wgpu adapter is present.
    pub fn is_available() -> bool {
        !Self::adapters().is_empty()
    }

    /// Describes every adapter, in enumeration order.
    pub fn adapters() -> Vec<wgpu::AdapterInfo> {
        Self::instance()
            .enumerate_adapters(wgpu::Backends::all())
            .iter()
            .map(|a| a.get_info())
            .collect()
    }

    /// Opens adapter `index` (as listed by [`WgpuDevice::adapters`]).
    pub fn open(index: usize) -> ComputeResult<Self> {
        pollster::block_on(Self::open_async(index))
    }

    /// Opens adapter `index` asynchronously.
    pub async fn open_async(index: usize) -> ComputeResult<Self> {
        let adapter = Self::instance()
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .nth(index)
            .ok_or_else(|| ComputeError::BackendNotAvailable(format!("wgpu adapter {index} not found")))?;

        let limits = adapter.limits();
        let adapter_info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("mmorph_device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| ComputeError::DeviceCreation(e.to_string()))?;

        device.on_uncaptured_error(Box::new(|e| {
            error!(error = %e, "Uncaptured wgpu error");
        }));

        let class = match adapter_info.device_type {
            wgpu::DeviceType::Cpu => DeviceClass::Cpu,
            _ => DeviceClass::Gpu,
        };
        let max_alloc = limits.max_buffer_size.min(limits.max_storage_buffer_binding_size as u64);
        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            backend: format!("{:?}", adapter_info.backend).to_lowercase(),
            class,
            compute_units: 0,
            max_work_group_size: limits.max_compute_invocations_per_workgroup as usize,
            max_work_item_sizes: [
                limits.max_compute_workgroup_size_x as usize,
                limits.max_compute_workgroup_size_y as usize,
            ],
            local_mem_bytes: limits.max_compute_workgroup_storage_size as usize,
            max_alloc_bytes: max_alloc as usize,
            global_mem_bytes: limits.max_buffer_size,
        };
        info!(device = %info.name, backend = %info.backend, class = %info.class, "wgpu device opened");

        Ok(Self {
            info,
            device: Arc::new(device),
            queue: Arc::new(queue),
            limits,
            module: None,
            pipelines: Mutex::new(HashMap::new()),
            clock: Clock::new(),
        })
    }

    /// Compiled pipeline for `name` with work-group size `local`.
    fn pipeline(&self, name: KernelName, local: NdRange) -> ComputeResult<Arc<wgpu::ComputePipeline>> {
        let key = (name, local.x() as u32, local.y() as u32);
        let mut cache = self
            .pipelines
            .lock()
            .map_err(|_| ComputeError::device(status::OUT_OF_RESOURCES, "pipeline cache poisoned"))?;
        if let Some(pipeline) = cache.get(&key) {
            return Ok(pipeline.clone());
        }

        let module = self
            .module
            .as_ref()
            .ok_or_else(|| ComputeError::device(status::INVALID_PROGRAM_EXECUTABLE, "no program built"))?;
        let constants = HashMap::from([
            ("wg_x".to_string(), key.1 as f64),
            ("wg_y".to_string(), key.2 as f64),
        ]);

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name.as_str()),
            layout: None, // Auto layout
            module,
            entry_point: Some(name.as_str()),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                ..Default::default()
            },
            cache: None,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ComputeError::device(status::INVALID_KERNEL_NAME, err.to_string()));
        }

        debug!(kernel = %name, local = %local, "Pipeline compiled");
        let pipeline = Arc::new(pipeline);
        cache.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    fn signal(&self, index: wgpu::SubmissionIndex, start: u64) -> Arc<dyn Signal> {
        let end = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let (cb_end, cb_done, clock) = (end.clone(), done.clone(), self.clock);
        self.queue.on_submitted_work_done(move || {
            cb_end.store(clock.now_ns(), Ordering::Release);
            cb_done.store(true, Ordering::Release);
        });
        Arc::new(SubmissionSignal {
            device: self.device.clone(),
            index,
            clock: self.clock,
            start,
            end,
            done,
        })
    }

    fn check_size(&self, size_bytes: usize) -> ComputeResult<()> {
        if size_bytes == 0 || size_bytes > self.info.max_alloc_bytes {
            return Err(ComputeError::device(
                status::INVALID_BUFFER_SIZE,
                format!("{size_bytes} bytes outside 1..={} bytes", self.info.max_alloc_bytes),
            ));
        }
        Ok(())
    }

    fn usage() -> wgpu::BufferUsages {
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
    }
}

impl AsAny for WgpuDevice {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl ComputeDevice for WgpuDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn build_program(&mut self, source: &str) -> ComputeResult<()> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("mmorph_program"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ComputeError::ProgramBuild { log: err.to_string() });
        }

        self.module = Some(module);
        if let Ok(mut cache) = self.pipelines.lock() {
            cache.clear();
        }

        // Resolve every entry point now so a missing one fails the build.
        let unit = NdRange::D2(1, 1);
        let log: Vec<String> = KernelName::ALL
            .into_iter()
            .filter_map(|name| self.pipeline(name, unit).err().map(|e| format!("{name}: {e}")))
            .collect();
        if !log.is_empty() {
            self.module = None;
            return Err(ComputeError::ProgramBuild { log: log.join("\n") });
        }

        debug!(device = %self.info.name, "Program built");
        Ok(())
    }

    fn has_program(&self) -> bool {
        self.module.is_some()
    }

    fn create_buffer(&self, size_bytes: usize, access: MemAccess) -> ComputeResult<DeviceBuffer> {
        self.check_size(size_bytes)?;
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("mmorph_buffer"),
            size: (size_bytes.div_ceil(ELEMENT_SIZE) * ELEMENT_SIZE) as u64,
            usage: Self::usage(),
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ComputeError::device(status::MEM_OBJECT_ALLOCATION_FAILURE, err.to_string()));
        }
        Ok(Arc::new(WgpuBuffer {
            id: next_buffer_id(),
            size_bytes,
            access,
            buffer,
        }))
    }

    fn create_buffer_init(&self, data: &[Pixel], access: MemAccess) -> ComputeResult<DeviceBuffer> {
        let size_bytes = std::mem::size_of_val(data);
        self.check_size(size_bytes)?;
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mmorph_buffer_init"),
            contents: bytemuck::cast_slice(data),
            usage: Self::usage(),
        });
        Ok(Arc::new(WgpuBuffer {
            id: next_buffer_id(),
            size_bytes,
            access,
            buffer,
        }))
    }

    fn enqueue_write(&self, dst: &DeviceBuffer, data: &[Pixel]) -> ComputeResult<Event> {
        let buf = wgpu_buffer(dst)?;
        let bytes = std::mem::size_of_val(data);
        if bytes > buf.size_bytes {
            return Err(ComputeError::device(
                status::INVALID_VALUE,
                format!("write of {bytes} bytes into a {}-byte buffer", buf.size_bytes),
            ));
        }
        let start = self.clock.now_ns();
        self.queue.write_buffer(&buf.buffer, 0, bytemuck::cast_slice(data));
        let index = self.queue.submit(std::iter::empty());
        Ok(Event::from_signal(Command::Write, self.signal(index, start)))
    }

    fn enqueue_read(&self, src: &DeviceBuffer, len: usize) -> ComputeResult<PendingRead> {
        let buf = wgpu_buffer(src)?;
        let bytes = len * ELEMENT_SIZE;
        if bytes > buf.size_bytes {
            return Err(ComputeError::device(
                status::INVALID_VALUE,
                format!("read of {bytes} bytes from a {}-byte buffer", buf.size_bytes),
            ));
        }
        let start = self.clock.now_ns();
        if len == 0 {
            return Ok(PendingRead::ready(Event::completed(Command::Read, start, start), Vec::new()));
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("mmorph_staging"),
            size: bytes as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("mmorph_read"),
        });
        encoder.copy_buffer_to_buffer(&buf.buffer, 0, &staging, 0, bytes as u64);
        let index = self.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });

        let event = Event::from_signal(Command::Read, self.signal(index.clone(), start));
        let device = self.device.clone();
        let resolve = move || -> ComputeResult<Vec<Pixel>> {
            let _ = device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
            rx.recv()
                .map_err(|_| ComputeError::device(status::OUT_OF_RESOURCES, "map channel closed"))?
                .map_err(|e| ComputeError::device(status::OUT_OF_RESOURCES, format!("map failed: {e}")))?;

            let slice = staging.slice(..);
            let data = slice.get_mapped_range();
            let result: Vec<Pixel> = bytemuck::cast_slice(&data).to_vec();
            drop(data);
            staging.unmap();
            Ok(result)
        };
        Ok(PendingRead::deferred(event, Box::new(resolve)))
    }

    fn enqueue_kernel(&self, launch: &KernelLaunch<'_>) -> ComputeResult<Event> {
        launch.validate(&self.info)?;
        let (wx, wy) = launch.workgroups();
        let max_groups = self.limits.max_compute_workgroups_per_dimension as usize;
        if wx > max_groups || wy > max_groups {
            return Err(ComputeError::device(
                status::INVALID_GLOBAL_WORK_SIZE,
                format!("{wx}x{wy} work-groups exceed {max_groups} per dimension"),
            ));
        }

        let name = launch.kernel.name();
        let pipeline = self.pipeline(name, launch.local)?;
        let input = wgpu_buffer(launch.input)?;
        let output = wgpu_buffer(launch.output)?;
        let se = launch.kernel.se_buffer().map(wgpu_buffer).transpose()?;

        let params = ParamsUniform {
            nrows: launch.nrows as i32,
            ncols: launch.ncols as i32,
            gx: launch.global.x() as u32,
            gy: launch.global.y() as u32,
            args: kernel_args(launch.kernel),
        };
        let params_buf = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mmorph_params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mut entries = vec![
            wgpu::BindGroupEntry { binding: 0, resource: input.buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: output.buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: params_buf.as_entire_binding() },
        ];
        if let Some(se) = se {
            entries.push(wgpu::BindGroupEntry { binding: 3, resource: se.buffer.as_entire_binding() });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let layout = pipeline.get_bind_group_layout(0);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(name.as_str()),
            layout: &layout,
            entries: &entries,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(name.as_str()),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(name.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(wx as u32, wy as u32, 1);
        }
        let command_buffer = encoder.finish();
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ComputeError::device(status::INVALID_KERNEL_ARGS, err.to_string()));
        }

        let start = self.clock.now_ns();
        let index = self.queue.submit(std::iter::once(command_buffer));
        Ok(Event::from_signal(Command::Kernel(name), self.signal(index, start)))
    }

    fn flush(&self) -> ComputeResult<()> {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        Ok(())
    }

    fn finish(&self) -> ComputeResult<()> {
        let _ = self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

// wgpu backends: one per adapter, running the three strategies as WGSL
// compute kernels. The tiled kernels keep their tile in `var<workgroup>`
// memory and meet at `workgroupBarrier()`.
//

use bytemuck::{Pod, Zeroable};
use pollster::block_on;
use tracing::{debug, info, warn};

use crate::{
    backend::{BackendDescriptor, ComputeBackend},
    device,
    error::EngineError,
    strategies::{KernelJob, TileScatter},
};

/// Uniform block shared by every kernel. Matches `Params` in the WGSL below.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Params {
    width: u32,
    height: u32,
    max_iterations: u32,
    bias_r: u32,
    bias_g: u32,
    bias_b: u32,
    _pad: [u32; 2],
    left: f32,
    right: f32,
    top: f32,
    bottom: f32,
}

impl Params {
    fn new(job: &KernelJob) -> Self {
        Params {
            width: job.grid.width as u32,
            height: job.grid.height as u32,
            max_iterations: job.max_iterations,
            bias_r: u32::from(job.bias.r),
            bias_g: u32::from(job.bias.g),
            bias_b: u32::from(job.bias.b),
            _pad: [0; 2],
            left: job.domain.left,
            right: job.domain.right,
            top: job.domain.top,
            bottom: job.domain.bottom,
        }
    }
}

/// WGSL for one tile edge. Workgroup size and tile memory are compile-time
/// constants, so each edge gets its own module.
fn build_shader(edge: usize) -> String {
    let members = edge * edge;
    format!(
        r#"
struct Params {{
    width: u32,
    height: u32,
    max_iterations: u32,
    bias_r: u32,
    bias_g: u32,
    bias_b: u32,
    _pad0: u32,
    _pad1: u32,
    left: f32,
    right: f32,
    top: f32,
    bottom: f32,
}};

struct Escape {{
    count: u32,
    escaped: bool,
}};

const EDGE: u32 = {edge}u;
const MEMBERS: u32 = {members}u;

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read_write> image: array<u32>;
@group(0) @binding(2) var<storage, read_write> flat: array<u32>;

var<workgroup> tile_values: array<u32, {members}>;

fn sample(x: u32, y: u32) -> vec2<f32> {{
    let cx = params.left + f32(x) * (params.right - params.left) / f32(params.width);
    let cy = params.top + f32(y) * (params.bottom - params.top) / f32(params.height);
    return vec2<f32>(cx, cy);
}}

fn iterate(c: vec2<f32>) -> Escape {{
    var z = vec2<f32>(0.0, 0.0);
    var count: u32 = 0u;
    while (sqrt(z.x * z.x + z.y * z.y) < 2.0 && count < params.max_iterations) {{
        z = vec2<f32>(z.x * z.x - z.y * z.y + c.x, z.x * z.y + z.y * z.x + c.y);
        count = count + 1u;
    }}
    return Escape(count, count < params.max_iterations);
}}

fn quadratic(e: Escape, bias: u32) -> u32 {{
    if (!e.escaped) {{ return bias; }}
    return e.count * e.count * bias;
}}

fn quintic_cubic(e: Escape, bias: u32) -> u32 {{
    let cubed = e.count * e.count * e.count;
    if (!e.escaped) {{ return cubed * bias; }}
    return cubed * e.count * e.count * bias;
}}

fn shade_packed(x: u32, y: u32) -> u32 {{
    let e = iterate(sample(x, y));
    return (quadratic(e, params.bias_r) << 16u)
        | (quadratic(e, params.bias_g) << 8u)
        | quadratic(e, params.bias_b);
}}

fn scatter(x: u32, y: u32, value: u32) {{
    let offset = (x * params.height + y) * 3u;
    flat[offset] = value;
    flat[offset + 1u] = value << 8u;
    flat[offset + 2u] = value << 16u;
}}

@compute @workgroup_size({edge}, {edge}, 1)
fn packed_main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let x = gid.x;
    let y = gid.y;
    if (x >= params.width || y >= params.height) {{ return; }}
    image[x * params.height + y] = shade_packed(x, y);
}}

@compute @workgroup_size({edge}, {edge}, 1)
fn channel_main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let x = gid.x;
    let y = gid.y;
    if (x >= params.width || y >= params.height) {{ return; }}
    let e = iterate(sample(x, y));
    let r = quintic_cubic(e, params.bias_r);
    let g = quintic_cubic(e, params.bias_g);
    let b = quintic_cubic(e, params.bias_b);
    let row_major = (x * params.width + y) * 3u;
    flat[row_major] = b;
    flat[row_major + 1u] = g << 8u;
    flat[row_major + 2u] = r << 16u;
    let transposed = (x + y * params.height) * 3u;
    flat[transposed] = b;
    flat[transposed + 1u] = g << 8u;
    flat[transposed + 2u] = r << 16u;
}}

// Grid dimensions are multiples of EDGE, so every invocation reaches the
// barrier.
fn stage_tile(gid: vec3<u32>, lid: vec3<u32>) {{
    let value = shade_packed(gid.x, gid.y);
    image[gid.x * params.height + gid.y] = value;
    tile_values[lid.x * EDGE + lid.y] = value;
}}

@compute @workgroup_size({edge}, {edge}, 1)
fn tiled_leader_main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
) {{
    stage_tile(gid, lid);
    workgroupBarrier();
    if (lid.x == 0u && lid.y == 0u) {{
        for (var m: u32 = 0u; m < MEMBERS; m = m + 1u) {{
            scatter(wid.x * EDGE + m / EDGE, wid.y * EDGE + m % EDGE, tile_values[m]);
        }}
    }}
}}

@compute @workgroup_size({edge}, {edge}, 1)
fn tiled_every_main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {{
    stage_tile(gid, lid);
    workgroupBarrier();
    for (var m: u32 = 0u; m < MEMBERS; m = m + 1u) {{
        scatter(gid.x, gid.y, tile_values[m]);
    }}
}}
"#
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kernel {
    Packed,
    Channel,
    Tiled(TileScatter),
}

struct Kernels {
    edge: usize,
    layout: wgpu::BindGroupLayout,
    packed: wgpu::ComputePipeline,
    channel: wgpu::ComputePipeline,
    tiled_leader: wgpu::ComputePipeline,
    tiled_every: wgpu::ComputePipeline,
}

impl Kernels {
    fn pipeline(&self, kernel: Kernel) -> &wgpu::ComputePipeline {
        match kernel {
            Kernel::Packed => &self.packed,
            Kernel::Channel => &self.channel,
            Kernel::Tiled(TileScatter::Leader) => &self.tiled_leader,
            Kernel::Tiled(TileScatter::EveryMember) => &self.tiled_every,
        }
    }
}

fn storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn build_kernels(device: &wgpu::Device, edge: usize) -> Kernels {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("tilebrot_kernels"),
        source: wgpu::ShaderSource::Wgsl(build_shader(edge).into()),
    });

    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("tilebrot_layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            storage_entry(1),
            storage_entry(2),
        ],
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("tilebrot_pipeline_layout"),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });

    let pipeline = |entry_point: &str| {
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry_point),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(entry_point),
            compilation_options: Default::default(),
            cache: None,
        })
    };

    Kernels {
        edge,
        packed: pipeline("packed_main"),
        channel: pipeline("channel_main"),
        tiled_leader: pipeline("tiled_leader_main"),
        tiled_every: pipeline("tiled_every_main"),
        layout,
    }
}

/// Device storage for each strategy's outputs plus mappable staging copies.
/// Packed and channel each write only one of the pair they are bound to.
struct GpuBuffers {
    cells: usize,
    params: wgpu::Buffer,
    packed: wgpu::Buffer,
    triplets: wgpu::Buffer,
    tiled: wgpu::Buffer,
    scatter: wgpu::Buffer,
    image_staging: wgpu::Buffer,
    flat_staging: wgpu::Buffer,
}

impl GpuBuffers {
    fn new(device: &wgpu::Device, cells: usize) -> Self {
        let image_size = (cells * std::mem::size_of::<u32>()) as u64;
        let flat_size = image_size * 3;
        let storage = |label: &str, size: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };
        let staging = |label: &str, size: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        GpuBuffers {
            cells,
            params: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("params"),
                size: std::mem::size_of::<Params>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            packed: storage("packed_image", image_size),
            triplets: storage("channel_triplets", flat_size),
            tiled: storage("tiled_image", image_size),
            scatter: storage("tiled_scatter", flat_size),
            image_staging: staging("image_staging", image_size),
            flat_staging: staging("flat_staging", flat_size),
        }
    }

    /// The (image, flat) pair bound at bindings 1 and 2 for `kernel`.
    fn outputs(&self, kernel: Kernel) -> (&wgpu::Buffer, &wgpu::Buffer) {
        match kernel {
            Kernel::Packed | Kernel::Channel => (&self.packed, &self.triplets),
            Kernel::Tiled(_) => (&self.tiled, &self.scatter),
        }
    }
}

pub struct GpuBackend {
    descriptor: BackendDescriptor,
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: wgpu::Limits,
    kernels: Option<Kernels>,
    buffers: Option<GpuBuffers>,
}

impl GpuBackend {
    pub fn new(index: usize, adapter: wgpu::Adapter) -> Result<Self, EngineError> {
        let info = adapter.get_info();
        let id = format!("gpu{index}-{:?}", info.backend).to_lowercase();
        let limits = adapter.limits();
        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("tilebrot"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| EngineError::runtime(&id, e))?;

        let is_cpu = info.device_type == wgpu::DeviceType::Cpu;
        let descriptor = BackendDescriptor {
            id,
            description: format!("{} ({:?})", info.name, info.backend),
            has_display: !is_cpu,
            is_emulated: is_cpu,
            is_debug: false,
            supports_double_precision: adapter.features().contains(wgpu::Features::SHADER_F64),
            dedicated_memory_bytes: 0,
        };
        Ok(GpuBackend {
            descriptor,
            device,
            queue,
            limits,
            kernels: None,
            buffers: None,
        })
    }

    fn fail(&self, reason: impl std::fmt::Display) -> EngineError {
        EngineError::runtime(&self.descriptor.id, reason)
    }

    fn prepare(&mut self, job: &KernelJob) -> Result<(), EngineError> {
        if self.kernels.as_ref().map(|k| k.edge) != Some(job.tile_edge) {
            debug!(edge = job.tile_edge, "compiling kernels");
            self.device.push_error_scope(wgpu::ErrorFilter::Validation);
            let kernels = build_kernels(&self.device, job.tile_edge);
            if let Some(e) = block_on(self.device.pop_error_scope()) {
                return Err(self.fail(e));
            }
            self.kernels = Some(kernels);
        }
        let cells = job.grid.cells();
        if self.buffers.as_ref().map(|b| b.cells) != Some(cells) {
            self.buffers = Some(GpuBuffers::new(&self.device, cells));
        }
        Ok(())
    }

    /// Dispatches `kernel` over the whole grid and copies its outputs into
    /// the staging buffers.
    #[tracing::instrument(level = "debug", skip(self, job), fields(backend = %self.descriptor.id))]
    fn execute(&mut self, job: &KernelJob, kernel: Kernel) -> Result<(), EngineError> {
        self.prepare(job)?;
        let (Some(kernels), Some(buffers)) = (self.kernels.as_ref(), self.buffers.as_ref()) else {
            return Err(self.fail("kernels not prepared"));
        };

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let (image, flat) = buffers.outputs(kernel);
        let params = Params::new(job);
        self.queue.write_buffer(&buffers.params, 0, bytemuck::bytes_of(&params));
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("tilebrot_bind_group"),
            layout: &kernels.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffers.params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: image.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: flat.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tilebrot_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("tilebrot_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(kernels.pipeline(kernel));
            pass.set_bind_group(0, &bind_group, &[]);
            let edge = job.tile_edge;
            pass.dispatch_workgroups(
                (job.grid.width / edge) as u32,
                (job.grid.height / edge) as u32,
                1,
            );
        }
        if kernel != Kernel::Channel {
            encoder.copy_buffer_to_buffer(image, 0, &buffers.image_staging, 0, image.size());
        }
        if kernel != Kernel::Packed {
            encoder.copy_buffer_to_buffer(flat, 0, &buffers.flat_staging, 0, flat.size());
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        let validation = block_on(self.device.pop_error_scope());
        let out_of_memory = block_on(self.device.pop_error_scope());
        match validation.or(out_of_memory) {
            Some(e) => Err(self.fail(e)),
            None => Ok(()),
        }
    }

    /// Maps `staging`, hands its words to `consume` and unmaps it again.
    fn read<F>(&self, staging: &wgpu::Buffer, consume: F) -> Result<(), EngineError>
    where
        F: FnOnce(&[u32]) -> Result<(), EngineError>,
    {
        let slice = staging.slice(..);
        let (tx, rx) = futures_channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        block_on(rx)
            .map_err(|_| self.fail("readback channel closed"))?
            .map_err(|e| self.fail(e))?;

        let consumed = {
            let view = slice.get_mapped_range();
            consume(bytemuck::cast_slice(&view))
        };
        staging.unmap();
        consumed
    }

    fn staging(&self) -> Result<&GpuBuffers, EngineError> {
        match &self.buffers {
            Some(buffers) => Ok(buffers),
            None => Err(self.fail("buffers not prepared")),
        }
    }
}

fn copy_into(host: &mut [u32]) -> impl FnOnce(&[u32]) -> Result<(), EngineError> + '_ {
    move |words| {
        host.copy_from_slice(words);
        Ok(())
    }
}

impl ComputeBackend for GpuBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn check_job(&self, job: &KernelJob) -> Result<(), EngineError> {
        let limits = &self.limits;
        let edge = job.tile_edge as u64;
        let invalid = |what: String| -> Result<(), EngineError> {
            let id = &self.descriptor.id;
            Err(EngineError::InvalidGrid(format!("{what} on {id}")))
        };
        if edge * edge > u64::from(limits.max_compute_invocations_per_workgroup)
            || edge > u64::from(limits.max_compute_workgroup_size_x)
            || edge > u64::from(limits.max_compute_workgroup_size_y)
        {
            return invalid(format!(
                "tile edge {edge} exceeds the work-group size limit"
            ));
        }
        if edge * edge * 4 > u64::from(limits.max_compute_workgroup_storage_size) {
            return invalid(format!("tile edge {edge} exceeds work-group memory"));
        }
        let (columns, rows) = job.grid.tiles(job.tile_edge);
        let max_groups = limits.max_compute_workgroups_per_dimension as usize;
        if columns > max_groups || rows > max_groups {
            return invalid(format!(
                "{columns}x{rows} work-groups exceed the dispatch limit"
            ));
        }
        let flat_bytes = job.grid.cells() as u64 * 3 * 4;
        if flat_bytes > u64::from(limits.max_storage_buffer_binding_size)
            || flat_bytes > limits.max_buffer_size
        {
            return invalid(format!(
                "{flat_bytes} byte output buffer exceeds storage limits"
            ));
        }
        Ok(())
    }

    fn packed(&mut self, job: &KernelJob, image: &mut [u32]) -> Result<(), EngineError> {
        self.execute(job, Kernel::Packed)?;
        let buffers = self.staging()?;
        self.read(&buffers.image_staging, copy_into(image))
    }

    fn channel(&mut self, job: &KernelJob, triplets: &mut [u32]) -> Result<(), EngineError> {
        self.execute(job, Kernel::Channel)?;
        let buffers = self.staging()?;
        self.read(&buffers.flat_staging, copy_into(triplets))
    }

    fn tiled(
        &mut self,
        job: &KernelJob,
        image: &mut [u32],
        scatter: &mut Vec<u32>,
    ) -> Result<(), EngineError> {
        self.execute(job, Kernel::Tiled(job.scatter))?;
        let buffers = self.staging()?;
        self.read(&buffers.flat_staging, |words| {
            device::copy_back(words.iter().copied(), scatter)
        })?;
        self.read(&buffers.image_staging, copy_into(image))
    }
}

/// One backend per adapter that yields a device. Adapters that fail are
/// logged and skipped.
pub fn discover() -> Vec<Box<dyn ComputeBackend>> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .enumerate()
        .filter_map(|(index, adapter)| match GpuBackend::new(index, adapter) {
            Ok(backend) => {
                info!(id = %backend.descriptor.id, "found GPU adapter");
                Some(Box::new(backend) as Box<dyn ComputeBackend>)
            }
            Err(e) => {
                warn!("skipping GPU adapter: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{colors::packed_triplet, strategies::test_support::job};

    #[test]
    fn params_match_the_uniform_layout() {
        assert_eq!(std::mem::size_of::<Params>(), 48);
    }

    #[test]
    fn shader_is_specialised_per_edge() {
        let source = build_shader(4);
        assert!(source.contains("@workgroup_size(4, 4, 1)"));
        assert!(source.contains("array<u32, 16>"));
        assert!(source.contains("workgroupBarrier()"));
    }

    // Needs an adapter; passes trivially on machines without one.
    #[test]
    fn tiled_scatter_matches_the_image_on_every_adapter() {
        let job = job(32, 32, 30);
        for mut backend in discover() {
            let mut image = vec![0; 32 * 32];
            let mut scatter = Vec::new();
            backend.tiled(&job, &mut image, &mut scatter).unwrap();
            for (index, value) in image.iter().enumerate() {
                assert_eq!(scatter[index * 3..index * 3 + 3], packed_triplet(*value));
            }
        }
    }
}

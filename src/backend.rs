//! Compute backends and the registry that discovers them.

use std::panic::{self, AssertUnwindSafe};

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    config::EngineConfig,
    device::{self, DeviceBuffer},
    error::EngineError,
    strategies::{channel, packed, tiled, KernelJob},
    workgroup::Cohort,
};

/// Capabilities of one backend, fixed once it has been discovered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub description: String,
    pub has_display: bool,
    pub is_emulated: bool,
    pub is_debug: bool,
    pub supports_double_precision: bool,
    /// Zero when the backend does not report it.
    pub dedicated_memory_bytes: u64,
}

/// A device that can run the three strategies. Every call blocks until the
/// device output has been synchronised into the host buffers it was given.
pub trait ComputeBackend: Send {
    fn descriptor(&self) -> &BackendDescriptor;

    /// Device-specific limits, checked when the backend is selected.
    fn check_job(&self, _job: &KernelJob) -> Result<(), EngineError> {
        Ok(())
    }

    fn packed(&mut self, job: &KernelJob, image: &mut [u32]) -> Result<(), EngineError>;

    fn channel(&mut self, job: &KernelJob, triplets: &mut [u32]) -> Result<(), EngineError>;

    /// `scatter` is replaced only when the whole copy-back succeeds.
    fn tiled(
        &mut self,
        job: &KernelJob,
        image: &mut [u32],
        scatter: &mut Vec<u32>,
    ) -> Result<(), EngineError>;
}

pub struct CpuBackend {
    descriptor: BackendDescriptor,
    pool: ThreadPool,
    lanes: usize,
    image: Option<DeviceBuffer>,
    triplets: Option<DeviceBuffer>,
    tiled_image: Option<DeviceBuffer>,
    scatter: Option<DeviceBuffer>,
}

impl CpuBackend {
    fn build(
        descriptor: BackendDescriptor,
        threads: usize,
        lanes: usize,
    ) -> Result<Self, EngineError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tilebrot-cpu-{i}"))
            .build()
            .map_err(|e| EngineError::runtime(&descriptor.id, e))?;
        Ok(CpuBackend {
            descriptor,
            pool,
            lanes,
            image: None,
            triplets: None,
            tiled_image: None,
            scatter: None,
        })
    }

    /// Rayon pool over `threads` workers (every core when `None`), with
    /// `lanes` threads cooperating on each work-group.
    pub fn thread_pool(threads: Option<usize>, lanes: usize) -> Result<Self, EngineError> {
        let threads = threads.unwrap_or_else(rayon::current_num_threads);
        let descriptor = BackendDescriptor {
            id: "cpu-pool".to_string(),
            description: format!(
                "CPU thread pool ({threads} threads, {lanes} lanes per group)"
            ),
            has_display: false,
            is_emulated: false,
            is_debug: false,
            supports_double_precision: true,
            dedicated_memory_bytes: 0,
        };
        Self::build(descriptor, threads, lanes)
    }

    /// Single-threaded reference device. Slow, but every dispatch runs in a
    /// fixed order.
    pub fn reference() -> Result<Self, EngineError> {
        let descriptor = BackendDescriptor {
            id: "cpu-reference".to_string(),
            description: "CPU reference device (single thread)".to_string(),
            has_display: false,
            is_emulated: true,
            is_debug: true,
            supports_double_precision: true,
            dedicated_memory_bytes: 0,
        };
        Self::build(descriptor, 1, 1)
    }

    /// Lanes are carved out of the pool's thread budget rather than added
    /// on top of it.
    fn cohort(&self) -> Cohort {
        let lanes = self.lanes.max(1);
        Cohort::new(self.pool.current_num_threads() / lanes, lanes)
    }
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "worker panicked".to_string()),
    }
}

impl ComputeBackend for CpuBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn packed(&mut self, job: &KernelJob, image: &mut [u32]) -> Result<(), EngineError> {
        let device = device::sized(&mut self.image, job.grid.cells());
        let (pool, id) = (&self.pool, &self.descriptor.id);
        let run = AssertUnwindSafe(|| pool.install(|| packed::run(job, device)));
        panic::catch_unwind(run).map_err(|p| EngineError::runtime(id, panic_reason(p)))?;
        device.synchronize(image);
        Ok(())
    }

    fn channel(&mut self, job: &KernelJob, triplets: &mut [u32]) -> Result<(), EngineError> {
        let device = device::sized(&mut self.triplets, job.grid.cells() * 3);
        let (pool, id) = (&self.pool, &self.descriptor.id);
        let run = AssertUnwindSafe(|| pool.install(|| channel::run(job, device)));
        panic::catch_unwind(run).map_err(|p| EngineError::runtime(id, panic_reason(p)))?;
        device.synchronize(triplets);
        Ok(())
    }

    fn tiled(
        &mut self,
        job: &KernelJob,
        image: &mut [u32],
        scatter: &mut Vec<u32>,
    ) -> Result<(), EngineError> {
        let cohort = self.cohort();
        let cells = job.grid.cells();
        let device_image = device::sized(&mut self.tiled_image, cells);
        let device_scatter = device::sized(&mut self.scatter, cells * 3);
        debug!(
            units = cohort.units,
            lanes = cohort.lanes,
            "dispatching work-groups"
        );
        tiled::run(job, cohort, device_image, device_scatter)
            .map_err(|fault| EngineError::runtime(&self.descriptor.id, fault))?;
        device_scatter.copy_back(scatter)?;
        device_image.synchronize(image);
        Ok(())
    }
}

type Discovery = Box<dyn FnOnce() -> Vec<Box<dyn ComputeBackend>> + Send>;

/// Discovers backends on first use and keeps the selected index.
pub struct BackendRegistry {
    discover: Option<Discovery>,
    backends: Vec<Box<dyn ComputeBackend>>,
    descriptors: Vec<BackendDescriptor>,
    enumerated: bool,
    selected: usize,
}

impl BackendRegistry {
    pub fn new<F>(discover: F) -> Self
    where
        F: FnOnce() -> Vec<Box<dyn ComputeBackend>> + Send + 'static,
    {
        BackendRegistry {
            discover: Some(Box::new(discover)),
            backends: Vec::new(),
            descriptors: Vec::new(),
            enumerated: false,
            selected: 0,
        }
    }

    pub fn from_backends(backends: Vec<Box<dyn ComputeBackend>>) -> Self {
        Self::new(move || backends)
    }

    /// GPU adapters first (with the `gpu` feature), then the CPU pool, then
    /// the CPU reference device.
    pub fn with_defaults(config: &EngineConfig) -> Self {
        let (threads, lanes) = (config.cpu_threads, config.cpu_lanes);
        Self::new(move || {
            let mut found: Vec<Box<dyn ComputeBackend>> = Vec::new();
            #[cfg(feature = "gpu")]
            found.extend(crate::gpu_engine::discover());
            for built in [
                CpuBackend::thread_pool(threads, lanes),
                CpuBackend::reference(),
            ] {
                match built {
                    Ok(backend) => found.push(Box::new(backend)),
                    Err(e) => warn!("skipping CPU backend: {e}"),
                }
            }
            found
        })
    }

    /// Runs discovery the first time; later calls return the same list.
    pub fn enumerate(&mut self) -> &[BackendDescriptor] {
        if !self.enumerated {
            if let Some(discover) = self.discover.take() {
                let backends = discover();
                self.descriptors = backends.iter().map(|b| b.descriptor().clone()).collect();
                self.backends = backends;
            }
            self.enumerated = true;
        }
        &self.descriptors
    }

    /// Out-of-range indices leave the previous selection in place.
    pub fn select(&mut self, index: usize) {
        if index < self.enumerate().len() {
            self.selected = index;
        }
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[BackendDescriptor] {
        &self.descriptors
    }

    /// The selected backend. Never falls back to another one.
    pub fn active(&mut self) -> Result<&mut dyn ComputeBackend, EngineError> {
        let count = self.backends.len();
        if count == 0 {
            return Err(EngineError::BackendUnavailable);
        }
        let index = self.selected;
        match self.backends.get_mut(index) {
            Some(backend) => Ok(&mut **backend),
            None => Err(EngineError::BackendIndex { index, count }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::strategies::test_support::job;

    struct Idle(BackendDescriptor);

    impl Idle {
        fn boxed(id: &str) -> Box<dyn ComputeBackend> {
            Box::new(Idle(BackendDescriptor {
                id: id.to_string(),
                description: id.to_string(),
                has_display: false,
                is_emulated: false,
                is_debug: false,
                supports_double_precision: false,
                dedicated_memory_bytes: 0,
            }))
        }
    }

    impl ComputeBackend for Idle {
        fn descriptor(&self) -> &BackendDescriptor {
            &self.0
        }
        fn packed(&mut self, _: &KernelJob, _: &mut [u32]) -> Result<(), EngineError> {
            Ok(())
        }
        fn channel(&mut self, _: &KernelJob, _: &mut [u32]) -> Result<(), EngineError> {
            Ok(())
        }
        fn tiled(
            &mut self,
            _: &KernelJob,
            _: &mut [u32],
            _: &mut Vec<u32>,
        ) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn four() -> BackendRegistry {
        BackendRegistry::from_backends(vec![
            Idle::boxed("a"),
            Idle::boxed("b"),
            Idle::boxed("c"),
            Idle::boxed("d"),
        ])
    }

    #[test]
    fn discovery_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = BackendRegistry::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![Idle::boxed("only")]
        });
        for _ in 0..5 {
            assert_eq!(registry.enumerate().len(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn selection_survives_enumeration() {
        let mut registry = four();
        registry.select(2);
        for _ in 0..10 {
            registry.enumerate();
            assert_eq!(registry.selected(), 2);
        }
        assert_eq!(registry.active().unwrap().descriptor().id, "c");
    }

    #[test]
    fn out_of_range_select_is_ignored() {
        let mut registry = four();
        registry.select(1);
        registry.select(4);
        registry.select(usize::MAX);
        assert_eq!(registry.selected(), 1);
    }

    #[test]
    fn empty_registry_is_unavailable() {
        let mut registry = BackendRegistry::from_backends(Vec::new());
        assert!(registry.enumerate().is_empty());
        assert!(matches!(
            registry.active(),
            Err(EngineError::BackendUnavailable)
        ));
    }

    #[test]
    fn reference_and_pool_agree() {
        let job = job(16, 16, 30);
        let mut pool = CpuBackend::thread_pool(Some(3), 4).unwrap();
        let mut reference = CpuBackend::reference().unwrap();
        let (mut a, mut b) = (vec![0; 256], vec![0; 256]);
        pool.packed(&job, &mut a).unwrap();
        reference.packed(&job, &mut b).unwrap();
        assert_eq!(a, b);

        let (mut scatter_a, mut scatter_b) = (Vec::new(), Vec::new());
        pool.tiled(&job, &mut a, &mut scatter_a).unwrap();
        reference.tiled(&job, &mut b, &mut scatter_b).unwrap();
        assert_eq!(a, b);
        assert_eq!(scatter_a, scatter_b);
        assert_eq!(scatter_a.len(), 256 * 3);
    }

    #[test]
    fn cohort_stays_within_the_pool() {
        let pool = CpuBackend::thread_pool(Some(8), 4).unwrap();
        assert_eq!(pool.cohort(), Cohort::new(2, 4));
        let narrow = CpuBackend::thread_pool(Some(2), 4).unwrap();
        assert_eq!(narrow.cohort(), Cohort::new(1, 4));
        let reference = CpuBackend::reference().unwrap();
        assert_eq!(reference.cohort(), Cohort::new(1, 1));
    }

    #[test]
    fn tiled_runs_leave_the_packed_device_image_alone() {
        let mut pool = CpuBackend::thread_pool(Some(2), 4).unwrap();
        let mut image = vec![0; 256];
        pool.packed(&job(16, 16, 30), &mut image).unwrap();
        let mut scatter = Vec::new();
        let mut tiled = vec![0; 256];
        let shallow = job(16, 16, 5);
        pool.tiled(&shallow, &mut tiled, &mut scatter).unwrap();
        assert_ne!(image, tiled);

        let mut again = vec![0; 256];
        pool.image.as_ref().unwrap().synchronize(&mut again);
        assert_eq!(again, image);
    }

    #[test]
    fn reference_is_flagged_as_emulated() {
        let reference = CpuBackend::reference().unwrap();
        assert!(reference.descriptor().is_emulated);
        assert!(reference.descriptor().is_debug);
    }
}

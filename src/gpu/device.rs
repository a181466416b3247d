// gpu/device.rs: wgpu device selection, configuration, and properties.
//
// Responsibilities:
//   - Select an adapter, either by index (explicit configuration) or by the
//     tiered policy below, and open a device on it.
//   - Expose a `DeviceProfile` for simulating hardware limits on a
//     development machine (e.g., cap invocations to match Raspberry Pi).
//   - Provide `WorkgroupSize`, validated against the active profile and
//     baked into the conv2d pipeline.
//   - Report `DeviceProperties` (name, backend, limits) once at startup.
//   - Route uncaptured wgpu errors and device loss to the log.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab llvmpipe/softpipe (a software renderer that still enumerates as
// a valid adapter). `AdapterSelection::Auto` enumerates explicitly and
// prefers real hardware; `AdapterSelection::Index(i)` takes the i-th
// enumerated adapter and fails if there is none.
//
// DEVICE LIMITS:
// We request *lower* limits than the hardware actually supports when
// running under a non-Native profile. wgpu validates every dispatch and
// allocation against the requested limits, so a batch that would not fit
// on the Pi fails on the laptop too.
//
// NEW RUST CONCEPTS:
// - `pollster::block_on`: runs an async fn to completion on the current
//   thread. wgpu's device/adapter API is async because on WebGPU it maps
//   to JS Promises, but natively we just block.
// - `Arc<AtomicBool>`: shared with the device-lost callback, which wgpu
//   may invoke from inside `poll` on any thread.
// - `impl FromStr`: lets clap and `from_env` parse "rpi" or "2" directly
//   into the config enums.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;

use crate::error::ConvError;
use crate::gpu::kernel::ConvKernel;

/// Environment variable holding an adapter index or `auto`.
pub const ENV_ADAPTER: &str = "BATCHCONV_ADAPTER";
/// Environment variable holding `native` or `rpi`.
pub const ENV_PROFILE: &str = "BATCHCONV_PROFILE";

/// Hardware profile controlling device limits and default workgroup sizes.
///
/// Use `Native` for best performance on your development machine.
/// Use `RaspberryPi` to simulate RPi 4/5 constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// Use the adapter's default limits. No artificial caps.
    #[default]
    Native,
    /// Simulate Raspberry Pi 4/5 (Broadcom VideoCore VI/VII, V3DV Vulkan).
    RaspberryPi,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::RaspberryPi => write!(f, "RaspberryPi (simulated limits)"),
        }
    }
}

impl FromStr for DeviceProfile {
    type Err = GpuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(DeviceProfile::Native),
            "rpi" | "raspberrypi" | "raspberry-pi" => Ok(DeviceProfile::RaspberryPi),
            _ => Err(GpuError::InvalidConfig { key: ENV_PROFILE, value: s.to_string() }),
        }
    }
}

/// Which adapter to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterSelection {
    /// Best available: real GPU first, anything as a last resort.
    #[default]
    Auto,
    /// The n-th adapter in enumeration order.
    Index(usize),
}

impl FromStr for AdapterSelection {
    type Err = GpuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            return Ok(AdapterSelection::Auto);
        }
        s.parse::<usize>()
            .map(AdapterSelection::Index)
            .map_err(|_| GpuError::InvalidConfig { key: ENV_ADAPTER, value: s.to_string() })
    }
}

/// A workgroup size configuration for 2D compute dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Select a validated default workgroup size for the given profile.
    ///
    /// - `Native` (NVIDIA/AMD): 16×8 = 128 invocations, 4 warps or 2
    ///   wavefronts, and 16 consecutive row elements per workgroup row.
    /// - `RaspberryPi`: 8×8 = 64 invocations, well inside the 256 limit.
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::RaspberryPi => WorkgroupSize { x: 8, y: 8 },
        }
    }

    /// Check this size against the profile's invocation limit.
    pub fn validate(self, profile: DeviceProfile) -> Result<Self, GpuError> {
        let max = max_invocations_for_profile(profile);
        let total = self.x.saturating_mul(self.y);
        if self.x == 0 || self.y == 0 || total > max {
            return Err(GpuError::WorkgroupTooLarge { total, max });
        }
        Ok(self)
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

// ============================================================
// Configuration
// ============================================================

/// How to open the GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuConfig {
    pub adapter: AdapterSelection,
    pub profile: DeviceProfile,
    pub backends: wgpu::Backends,
    /// Overrides the profile's default workgroup size.
    pub workgroup: Option<WorkgroupSize>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        GpuConfig {
            adapter: AdapterSelection::Auto,
            profile: DeviceProfile::Native,
            backends: wgpu::Backends::PRIMARY,
            workgroup: None,
        }
    }
}

impl GpuConfig {
    /// Defaults overridden by `BATCHCONV_ADAPTER`, `BATCHCONV_PROFILE`, and
    /// wgpu's own `WGPU_BACKEND`.
    pub fn from_env() -> Result<Self, GpuError> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        if let Some(backends) = wgpu::util::backend_bits_from_env() {
            config.backends = backends;
        }
        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GpuError> {
        let mut config = GpuConfig::default();
        if let Some(v) = lookup(ENV_ADAPTER) {
            config.adapter = v.parse()?;
        }
        if let Some(v) = lookup(ENV_PROFILE) {
            config.profile = v.parse()?;
        }
        Ok(config)
    }
}

// ============================================================
// Properties
// ============================================================

/// What the selected adapter is and what it allows.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
    pub driver: String,
    pub max_invocations_per_workgroup: u32,
    pub max_workgroup_size: [u32; 3],
    pub max_workgroups_per_dimension: u32,
    pub max_buffer_size: u64,
    pub max_storage_binding_size: u32,
}

impl DeviceProperties {
    fn new(info: &wgpu::AdapterInfo, limits: &wgpu::Limits) -> Self {
        DeviceProperties {
            name: info.name.clone(),
            vendor: info.vendor,
            device: info.device,
            device_type: info.device_type,
            backend: info.backend,
            driver: format!("{} {}", info.driver, info.driver_info).trim().to_string(),
            max_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
            max_workgroup_size: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            max_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
            max_buffer_size: limits.max_buffer_size,
            max_storage_binding_size: limits.max_storage_buffer_binding_size,
        }
    }
}

impl fmt::Display for DeviceProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device: {} ({:?}, {:?})", self.name, self.backend, self.device_type)?;
        writeln!(f, "  vendor/device id:          {:#06x}/{:#06x}", self.vendor, self.device)?;
        if !self.driver.is_empty() {
            writeln!(f, "  driver:                    {}", self.driver)?;
        }
        writeln!(f, "  max invocations/workgroup: {}", self.max_invocations_per_workgroup)?;
        let [x, y, z] = self.max_workgroup_size;
        writeln!(f, "  max workgroup size:        {x}×{y}×{z}")?;
        writeln!(f, "  max workgroups/dimension:  {}", self.max_workgroups_per_dimension)?;
        writeln!(f, "  max buffer size:           {} MiB", self.max_buffer_size >> 20)?;
        write!(f, "  max storage binding:       {} MiB", self.max_storage_binding_size >> 20)
    }
}

// ============================================================
// GpuDevice
// ============================================================

/// The GPU context: device, queue, conv2d pipeline, and active profile.
///
/// Hold one `GpuDevice` for the lifetime of the application; it is
/// expensive to create. Every convolution call allocates and frees its own
/// buffers on it.
///
/// # Field drop order
/// Rust drops struct fields in declaration order (top → bottom). The
/// pipeline goes before the device, and `_instance` is declared last so the
/// `wgpu::Instance` outlives `device` and `queue`.
pub struct GpuDevice {
    pub(crate) kernel: ConvKernel,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub workgroup_size: WorkgroupSize,
    properties: DeviceProperties,
    lost: Arc<AtomicBool>,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Open the best available adapter with `DeviceProfile::Native` limits.
    pub fn new() -> Result<Self, GpuError> {
        Self::with_config(&GpuConfig::default())
    }

    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, GpuError> {
        Self::with_config(&GpuConfig { profile, ..GpuConfig::default() })
    }

    pub fn with_config(config: &GpuConfig) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(config))
    }

    async fn init_async(config: &GpuConfig) -> Result<Self, GpuError> {
        // ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER keeps layered drivers such
        // as dzn (D3D12→Vulkan on WSL2) in the enumeration. Compute-only
        // storage-buffer work does not depend on the conformance gaps.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: config.backends,
            flags,
            ..Default::default()
        });

        let adapter = select_adapter(&instance, config)?;
        let raw_info = adapter.get_info();

        // Auto-detect RPi when the caller passed Native but the adapter is V3D.
        let profile = match config.profile {
            DeviceProfile::Native if raw_info.name.to_ascii_lowercase().contains("v3d") => {
                info!("V3D adapter detected, using RaspberryPi profile");
                DeviceProfile::RaspberryPi
            }
            other => other,
        };

        let workgroup_size = config
            .workgroup
            .unwrap_or_else(|| WorkgroupSize::for_profile(profile))
            .validate(profile)?;

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("batchconv"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits_for_profile(profile),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        device.on_uncaptured_error(Box::new(|e: wgpu::Error| error!("uncaptured wgpu error: {e}")));
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            flag.store(true, Ordering::Release);
            error!("device lost ({reason:?}): {message}");
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let kernel = ConvKernel::new(&device, workgroup_size);
        if let Some(e) = device.pop_error_scope().await {
            return Err(GpuError::Pipeline(e.to_string()));
        }

        let properties = DeviceProperties::new(&raw_info, &device.limits());
        info!("opened {} ({profile}, workgroup {workgroup_size})", properties.name);

        Ok(GpuDevice {
            kernel,
            device,
            queue,
            profile,
            workgroup_size,
            properties,
            lost,
            _instance: instance,
        })
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Whether wgpu has reported the device as lost.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {} ({:?}), profile: {}, workgroup: {} }}",
            self.properties.name, self.properties.backend, self.profile, self.workgroup_size
        )
    }
}

/// Pick the adapter named by `config.adapter`.
fn select_adapter(instance: &wgpu::Instance, config: &GpuConfig) -> Result<wgpu::Adapter, GpuError> {
    let mut adapters = instance.enumerate_adapters(config.backends);
    if adapters.is_empty() {
        return Err(GpuError::NoSuitableAdapter(config.backends));
    }
    for (i, a) in adapters.iter().enumerate() {
        let info = a.get_info();
        info!("adapter {i}: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
    }

    match config.adapter {
        AdapterSelection::Index(index) => {
            let available = adapters.len();
            if index >= available {
                return Err(GpuError::AdapterIndexOutOfRange { index, available });
            }
            Ok(adapters.swap_remove(index))
        }
        // Tier 1: real or virtualised hardware. Tier 2: whatever is left,
        // including software renderers.
        AdapterSelection::Auto => {
            let hardware = adapters
                .iter()
                .position(|a| !matches!(a.get_info().device_type, wgpu::DeviceType::Cpu));
            let index = hardware.unwrap_or_else(|| {
                warn!("only software adapters available; falling back to adapter 0");
                0
            });
            Ok(adapters.swap_remove(index))
        }
    }
}

// ============================================================
// Limits helpers
// ============================================================

/// Build wgpu limits for the given profile.
fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),

        DeviceProfile::RaspberryPi => wgpu::Limits {
            // VideoCore VI/VII: vulkaninfo reports 256 max invocations.
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            // 128 MiB per binding. The Pi shares 4 GiB between CPU and GPU.
            max_storage_buffer_binding_size: 128 << 20,
            max_buffer_size: 256 << 20,
            ..wgpu::Limits::default()
        },
    }
}

/// Maximum compute invocations per workgroup for the given profile.
fn max_invocations_for_profile(profile: DeviceProfile) -> u32 {
    limits_for_profile(profile).max_compute_invocations_per_workgroup
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU device initialization and configuration.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No adapter enumerated on the requested backends.
    #[error("no GPU adapter found on backends {0:?}")]
    NoSuitableAdapter(wgpu::Backends),

    #[error("adapter index {index} out of range ({available} adapters enumerated)")]
    AdapterIndexOutOfRange { index: usize, available: usize },

    /// wgpu device request failed (driver issue, unsupported limits, etc.).
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("workgroup size {total} exceeds profile limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },

    #[error("conv2d pipeline creation failed: {0}")]
    Pipeline(String),

    #[error("invalid {key}: {value:?}")]
    InvalidConfig { key: &'static str, value: String },
}

impl From<GpuError> for ConvError {
    fn from(e: GpuError) -> Self {
        ConvError::DeviceUnavailable(e.to_string())
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // NOTE: Tests that require an actual GPU are behind `#[ignore]` so that
    // `cargo test` passes in CI without a GPU. Run with:
    //   cargo test -- --include-ignored

    #[test]
    fn test_workgroup_size_for_native() {
        let ws = WorkgroupSize::for_profile(DeviceProfile::Native);
        assert_eq!(ws, WorkgroupSize { x: 16, y: 8 });
        assert_eq!(ws.total(), 128);
    }

    #[test]
    fn test_workgroup_size_for_rpi() {
        let ws = WorkgroupSize::for_profile(DeviceProfile::RaspberryPi);
        assert_eq!(ws, WorkgroupSize { x: 8, y: 8 });
        assert!(ws.total() <= 256);
    }

    #[test]
    fn test_workgroup_validation() {
        let ok = WorkgroupSize { x: 16, y: 16 }.validate(DeviceProfile::RaspberryPi);
        assert!(ok.is_ok());
        let err = WorkgroupSize { x: 16, y: 17 }.validate(DeviceProfile::RaspberryPi).unwrap_err();
        assert!(matches!(err, GpuError::WorkgroupTooLarge { total: 272, max: 256 }));
        assert!(WorkgroupSize { x: 0, y: 8 }.validate(DeviceProfile::Native).is_err());
    }

    #[test]
    fn test_rpi_limits_cap_invocations() {
        let limits = limits_for_profile(DeviceProfile::RaspberryPi);
        assert_eq!(limits.max_compute_invocations_per_workgroup, 256);
        assert_eq!(limits.max_storage_buffer_binding_size, 128 << 20);
    }

    #[test]
    fn test_native_limits_are_default() {
        assert_eq!(limits_for_profile(DeviceProfile::Native), wgpu::Limits::default());
    }

    #[test]
    fn test_parse_selection_and_profile() {
        assert_eq!("auto".parse::<AdapterSelection>().unwrap(), AdapterSelection::Auto);
        assert_eq!(" 2 ".parse::<AdapterSelection>().unwrap(), AdapterSelection::Index(2));
        assert!("gpu0".parse::<AdapterSelection>().is_err());
        assert_eq!("RPi".parse::<DeviceProfile>().unwrap(), DeviceProfile::RaspberryPi);
        assert!("laptop".parse::<DeviceProfile>().is_err());
    }

    #[test]
    fn test_config_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([(ENV_ADAPTER, "1"), (ENV_PROFILE, "rpi")]);
        let config = GpuConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.adapter, AdapterSelection::Index(1));
        assert_eq!(config.profile, DeviceProfile::RaspberryPi);
        assert_eq!(config.backends, wgpu::Backends::PRIMARY);

        let empty = GpuConfig::from_lookup(|_| None).unwrap();
        assert_eq!(empty, GpuConfig::default());

        let bad = GpuConfig::from_lookup(|k| (k == ENV_ADAPTER).then(|| "x".to_string()));
        assert!(matches!(bad, Err(GpuError::InvalidConfig { key: ENV_ADAPTER, .. })));
    }

    #[test]
    fn test_gpu_error_becomes_device_unavailable() {
        let err: ConvError = GpuError::AdapterIndexOutOfRange { index: 3, available: 1 }.into();
        assert!(matches!(err, ConvError::DeviceUnavailable(ref m) if m.contains("index 3")));
    }

    // ---- GPU integration tests (subprocess isolation) -------------------------
    //
    // dzn (Microsoft's D3D12-to-Vulkan layer on WSL2) crashes with SIGSEGV
    // during process exit once any device has been created in the process.
    // Each GPU test therefore runs in a child process: the child does the
    // real assertions and prints "GPU_TEST_OK"; the parent checks only the
    // output, not the exit code.

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    // ---- Inner tests (run inside the subprocess, marked #[ignore]) ----------

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_device_init_native() {
        let gpu = GpuDevice::new().expect("should open a GPU device");
        println!("{gpu}");
        println!("{}", gpu.properties());
        assert!(gpu.properties().max_workgroups_per_dimension > 0);
        assert!(!gpu.is_lost());
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_device_init_rpi_profile() {
        let gpu = GpuDevice::new_with_profile(DeviceProfile::RaspberryPi)
            .expect("RPi profile should work on any device");
        assert_eq!(gpu.profile, DeviceProfile::RaspberryPi);
        assert_eq!(gpu.workgroup_size, WorkgroupSize { x: 8, y: 8 });
        assert_eq!(gpu.properties().max_invocations_per_workgroup, 256);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_adapter_index_out_of_range() {
        let config = GpuConfig { adapter: AdapterSelection::Index(10_000), ..GpuConfig::default() };
        let err = GpuDevice::with_config(&config).err().expect("index 10000 cannot exist");
        assert!(matches!(err, GpuError::AdapterIndexOutOfRange { index: 10_000, .. }), "{err}");
        println!("GPU_TEST_OK");
    }

    // ---- Outer tests (each spawns one subprocess) ---------------------------

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_gpu_device_init_native() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_gpu_device_init_native");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_gpu_device_init_rpi_profile() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_gpu_device_init_rpi_profile");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_adapter_index_out_of_range() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_adapter_index_out_of_range");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}

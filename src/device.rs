use std::sync::Mutex;

/// Identifies where a value lives and where kernels for it execute.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum DeviceDescriptor {
    Cpu,
    Accelerator(usize),
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceDescriptor::Cpu => write!(f, "cpu"),
            DeviceDescriptor::Accelerator(id) => write!(f, "accelerator:{id}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceError {
    /// The process-wide default device was already used implicitly and can
    /// no longer be changed.
    DefaultDeviceFrozen,
    /// The requested device cannot execute the operation.
    DeviceUnavailable(DeviceDescriptor),
}

struct DefaultDeviceCell {
    device: DeviceDescriptor,
    frozen: bool,
}

static DEFAULT_DEVICE: Mutex<DefaultDeviceCell> =
    Mutex::new(DefaultDeviceCell { device: DeviceDescriptor::Cpu, frozen: false });

/// The process-wide default device. Calling this freezes the default: any
/// later `set_default_device` fails rather than silently changing placement
/// mid-run.
pub fn default_device() -> DeviceDescriptor {
    let mut cell = DEFAULT_DEVICE.lock().unwrap();
    cell.frozen = true;
    cell.device
}

/// Changes the process-wide default device. Fails with
/// `DeviceError::DefaultDeviceFrozen` once any operation has implicitly
/// depended on the default.
pub fn set_default_device(device: DeviceDescriptor) -> Result<(), DeviceError> {
    let mut cell = DEFAULT_DEVICE.lock().unwrap();

    if cell.frozen {
        return Err(DeviceError::DefaultDeviceFrozen);
    }

    cell.device = device;
    Ok(())
}

use std::sync::{Arc, Mutex, PoisonError};

use candle_core::{Device, Result};
use tracing::debug;

/// Offloading setting during loading.
///
/// - Full: keep the largest components in host memory and copy them to the compute device
///   while they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offloading {
    Full,
}

type Build<M> = Box<dyn Fn(&Device) -> Result<M> + Send + Sync>;

/// Where the weights of a model live between uses.
pub enum Residency<M> {
    /// Always on the compute device.
    Device(Arc<M>),
    /// In host memory. `build` places a copy on `device`, which lives until
    /// [`Residency::release`].
    Host {
        device: Device,
        build: Build<M>,
        resident: Mutex<Option<Arc<M>>>,
    },
}

impl<M> Residency<M> {
    pub fn on_device(model: M) -> Self {
        Self::Device(Arc::new(model))
    }

    /// `build` must read its weights from host memory, it is called once per use.
    pub fn offloaded(
        device: Device,
        build: impl Fn(&Device) -> Result<M> + Send + Sync + 'static,
    ) -> Self {
        Self::Host {
            device,
            build: Box::new(build),
            resident: Mutex::new(None),
        }
    }

    /// The model on the compute device, copying it there first if it was offloaded.
    pub fn acquire(&self) -> Result<Arc<M>> {
        match self {
            Self::Device(model) => Ok(model.clone()),
            Self::Host {
                device,
                build,
                resident,
            } => {
                let mut slot = resident.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(model) = slot.as_ref() {
                    return Ok(model.clone());
                }
                debug!("copying offloaded weights to {device:?}");
                let model = Arc::new(build(device)?);
                *slot = Some(model.clone());
                Ok(model)
            }
        }
    }

    /// Drop the device copy of an offloaded model. No-op for models kept on the device.
    pub fn release(&self) {
        if let Self::Host { resident, .. } = self {
            resident
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
    }

    pub fn is_resident(&self) -> bool {
        match self {
            Self::Device(_) => true,
            Self::Host { resident, .. } => resident
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some(),
        }
    }
}

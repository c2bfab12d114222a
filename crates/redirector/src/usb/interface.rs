//! USB interface and its pipe set

use crate::usb::pipe::UsbPipe;
use common::UsbBus;
use protocol::{UsbError, UsbResult, UsbStatus};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tracing::{debug, error, warn};

/// Pipes of one alt-setting selection
#[derive(Debug, Default)]
struct PipeSet {
    generation: u64,
    alt_setting: u8,
    pipes: Vec<UsbPipe>,
}

/// One interface of the selected configuration
///
/// The pipe set is replaced wholesale on every alt-setting selection.
/// Readers take a snapshot of a single pipe and never see a half-built set.
pub struct UsbInterface {
    number: u8,
    bus: Arc<dyn UsbBus>,
    pipes: RwLock<PipeSet>,
}

impl UsbInterface {
    /// Bind to interface `number` and select its default setting
    pub fn create(bus: Arc<dyn UsbBus>, number: u8) -> UsbResult<Self> {
        let interface = Self {
            number,
            bus,
            pipes: RwLock::new(PipeSet::default()),
        };
        interface.set_alt_setting(0)?;
        Ok(interface)
    }

    fn pipe_set(&self) -> RwLockReadGuard<'_, PipeSet> {
        self.pipes.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Select `alt_setting` and rebuild the pipe set
    ///
    /// The new set replaces the old one only once every pipe of it is built.
    /// A failed selection or pipe creation leaves the previous set, its
    /// setting number and its generation in place.
    pub fn set_alt_setting(&self, alt_setting: u8) -> UsbStatus {
        let mut set = self.pipes.write().unwrap_or_else(PoisonError::into_inner);

        if let Err(e) = self.bus.select_setting(self.number, alt_setting) {
            error!(
                "Failed to select setting {} on interface {}: {}",
                alt_setting, self.number, e
            );
            return Err(e);
        }

        let generation = set.generation + 1;
        let count = self.bus.num_configured_pipes(self.number);
        let mut pipes = Vec::new();
        if pipes.try_reserve_exact(usize::from(count)).is_err() {
            error!(
                "Cannot allocate {} pipes for interface {}",
                count, self.number
            );
            return Err(UsbError::InsufficientResources);
        }
        for index in 0..count {
            let pipe = UsbPipe::create(&*self.bus, self.number, index, generation)
                .inspect_err(|e| {
                    error!(
                        "Failed to create pipe {} of interface {} at setting {}: {}",
                        index, self.number, alt_setting, e
                    )
                })?;
            pipes.push(pipe);
        }

        *set = PipeSet {
            generation,
            alt_setting,
            pipes,
        };

        debug!(
            "Interface {} now at setting {} with {} pipes (generation {})",
            self.number, alt_setting, count, generation
        );
        Ok(())
    }

    /// First pipe of the current set addressing `endpoint_address`
    pub fn find_pipe_by_endpoint_address(&self, endpoint_address: u8) -> Option<UsbPipe> {
        self.pipe_set()
            .pipes
            .iter()
            .find(|pipe| pipe.endpoint_address() == endpoint_address)
            .copied()
    }

    /// Abort then reset every pipe, reporting the last failure
    pub fn reset(&self) -> UsbStatus {
        let set = self.pipe_set();
        let mut result = Ok(());

        for pipe in &set.pipes {
            if let Err(e) = pipe.abort(&*self.bus) {
                result = Err(e);
            }
            if let Err(e) = pipe.reset(&*self.bus) {
                result = Err(e);
            }
        }

        if let Err(e) = result {
            warn!("Reset of interface {} incomplete: {}", self.number, e);
        }
        result
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn alt_setting(&self) -> u8 {
        self.pipe_set().alt_setting
    }

    pub fn generation(&self) -> u64 {
        self.pipe_set().generation
    }

    pub fn pipe_count(&self) -> usize {
        self.pipe_set().pipes.len()
    }

    pub fn endpoint_addresses(&self) -> Vec<u8> {
        self.pipe_set()
            .pipes
            .iter()
            .map(UsbPipe::endpoint_address)
            .collect()
    }
}

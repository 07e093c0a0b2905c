//! Process-wide host state, passed explicitly instead of living in globals.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use super::handle::{ComputerHandle, ComputerRegistry};
use super::ComputerId;
use crate::config::HostConfig;
use crate::dispatcher::TaskDispatcher;
use crate::router::HandlerRegistry;
use crate::screen::WindowId;
use crate::vfs::VirtualRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// Answer to a "computer not responding" prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotResponding {
    Restart,
    Wait,
}

/// Decisions and notices that need the embedding UI.
///
/// Always called on the owner thread through the [`TaskDispatcher`].
pub trait HostUi: Send + Sync {
    fn show_message(&self, window: Option<WindowId>, level: MessageLevel, title: &str, message: &str);
    fn not_responding(&self, computer: ComputerId) -> NotResponding;
    fn confirm_mount(&self, computer: ComputerId, backing: &str, read_only: bool) -> bool;
}

/// UI for hosts without a screen: logs notices, keeps waiting, allows mounts.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessUi;

impl HostUi for HeadlessUi {
    fn show_message(&self, window: Option<WindowId>, level: MessageLevel, title: &str, message: &str) {
        match level {
            MessageLevel::Info => info!(?window, title, message, "host message"),
            _ => warn!(?window, ?level, title, message, "host message"),
        }
    }

    fn not_responding(&self, computer: ComputerId) -> NotResponding {
        warn!(computer, "computer not responding; waiting");
        NotResponding::Wait
    }

    fn confirm_mount(&self, _computer: ComputerId, _backing: &str, _read_only: bool) -> bool {
        true
    }
}

/// Hands out the lowest free window id.
#[derive(Debug, Default)]
pub struct WindowAllocator {
    used: Mutex<BTreeSet<WindowId>>,
}

impl WindowAllocator {
    pub fn allocate(&self) -> WindowId {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let id = (0..).find(|id| !used.contains(id)).unwrap_or(WindowId::MAX);
        used.insert(id);
        id
    }

    pub fn release(&self, id: WindowId) {
        self.used.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }

    pub fn in_use(&self) -> usize {
        self.used.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Everything a computer needs from its host. Cheap to clone.
#[derive(Clone)]
pub struct HostContext {
    pub config: Arc<HostConfig>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub runtime: tokio::runtime::Handle,
    pub ui: Arc<dyn HostUi>,
    pub images: Arc<VirtualRegistry>,
    pub computers: Arc<ComputerRegistry>,
    pub windows: Arc<WindowAllocator>,
    pub handlers: Arc<HandlerRegistry>,
}

impl HostContext {
    pub fn new(
        config: HostConfig,
        dispatcher: Arc<TaskDispatcher>,
        runtime: tokio::runtime::Handle,
        ui: Arc<dyn HostUi>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher,
            runtime,
            ui,
            images: Arc::new(VirtualRegistry::new()),
            computers: Arc::new(ComputerRegistry::default()),
            windows: Arc::new(WindowAllocator::default()),
            handlers: Arc::new(HandlerRegistry::default()),
        }
    }

    /// Open a monitor window for `computer`, named by its peripheral side.
    pub fn attach_monitor(&self, computer: &ComputerHandle, side: &str) -> Option<WindowId> {
        let shared = computer.upgrade()?;
        let window = self.windows.allocate();
        shared
            .monitors()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(window, side.to_string());
        info!(computer = computer.id(), window, side, "monitor attached");
        Some(window)
    }

    /// Show a notice on the owner thread without waiting for it.
    pub fn notify(&self, window: Option<WindowId>, level: MessageLevel, title: &str, message: &str) {
        let ui = Arc::clone(&self.ui);
        let (title, message) = (title.to_string(), message.to_string());
        self.dispatcher.submit_async(move || {
            ui.show_message(window, level, &title, &message);
            Ok(())
        });
    }

    /// Stop every computer and wait for their threads.
    pub fn shutdown(&self) {
        let live = self.computers.live();
        info!(computers = live.len(), "shutting down host");
        for handle in &live {
            handle.shutdown();
        }
        self.computers.join_all();
    }
}

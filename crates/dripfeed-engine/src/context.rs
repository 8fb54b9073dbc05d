// Shared engine context — the wiring point for stores, clocks, transport,
// and configuration.

use std::sync::Arc;

use dripfeed_core::clock::Clock;
use dripfeed_core::options::DripOptions;
use dripfeed_core::settings::SettingsCache;
use dripfeed_core::store::Store;

use crate::ports::MessageSender;

/// Everything the engine components need, behind one `Arc`.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub store: Arc<dyn Store>,
    pub sender: Arc<dyn MessageSender>,
    pub clock: Arc<dyn Clock>,
    pub options: DripOptions,
    pub settings: SettingsCache,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn Store>,
        sender: Arc<dyn MessageSender>,
        clock: Arc<dyn Clock>,
        options: DripOptions,
    ) -> Arc<Self> {
        let settings = SettingsCache::new(store.clone(), clock.clone());
        Arc::new(Self {
            store,
            sender,
            clock,
            options,
            settings,
        })
    }
}

use std::sync::Arc;

use crate::{
    admission::{AdmissionGate, SourceAddressKey},
    config::Config,
    rate_limit::LimiterStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gate: AdmissionGate,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(LimiterStore::new(config.limiter_settings()));
        let extractor = Arc::new(SourceAddressKey {
            trust_proxy: config.trust_proxy,
        });

        Self {
            gate: AdmissionGate::new(store, extractor),
            config: Arc::new(config),
        }
    }

    pub fn limiter(&self) -> Arc<LimiterStore> {
        Arc::clone(self.gate.store())
    }
}

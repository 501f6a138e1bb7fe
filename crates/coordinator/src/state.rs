use crate::{config::CoordinatorConfig, service::Coordinator};
use std::sync::Arc;

#[derive(Clone)]
pub struct CoordinatorState {
  inner: Arc<StateInner>,
}

struct StateInner {
  config: CoordinatorConfig,
  coordinator: Coordinator,
}

impl CoordinatorState {
  pub fn new(config: CoordinatorConfig, coordinator: Coordinator) -> Self {
    Self {
      inner: Arc::new(StateInner {
        config,
        coordinator,
      }),
    }
  }

  pub fn config(&self) -> &CoordinatorConfig {
    &self.inner.config
  }

  pub fn coordinator(&self) -> &Coordinator {
    &self.inner.coordinator
  }
}

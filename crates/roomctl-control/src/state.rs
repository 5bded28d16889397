use roomctl_manager::ProcessManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: ProcessManager,
}

impl AppState {
    pub fn new(manager: ProcessManager) -> Self {
        Self { manager }
    }
}

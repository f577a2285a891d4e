/// The phase a running workflow is in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkflowStep {
    #[default]
    Zeroing,
    Arming,
    Observing,
    Collecting,
    Finalizing,
    Done,
}

impl std::fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zeroing => write!(f, "Zeroing triggers"),
            Self::Arming => write!(f, "Arming triggers"),
            Self::Observing => write!(f, "Observing trigger rates"),
            Self::Collecting => write!(f, "Collecting records"),
            Self::Finalizing => write!(f, "Finalizing"),
            Self::Done => write!(f, "Done"),
        }
    }
}

/// Progress report sent from a workflow to whoever is watching it
#[derive(Debug, Clone, Default)]
pub struct WorkflowStatus {
    pub progress: f32,
    pub step: WorkflowStep,
    pub message: String,
}

impl WorkflowStatus {
    pub fn new(progress: f32, step: WorkflowStep, message: String) -> Self {
        Self {
            progress,
            step,
            message,
        }
    }
}

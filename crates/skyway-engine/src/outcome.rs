//! How a plan node finished.

use skyway_core::build::BuildStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// A script or task exited non-zero.
    Failed,
    /// Something other than the user's code went wrong.
    Errored,
    Aborted,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Succeeded
    }

    /// The worse of two unsuccessful outcomes; an error outranks a failure.
    pub fn worst(self, other: Outcome) -> Outcome {
        fn rank(o: Outcome) -> u8 {
            match o {
                Outcome::Succeeded => 0,
                Outcome::Failed => 1,
                Outcome::Errored => 2,
                Outcome::Aborted => 3,
            }
        }
        if rank(other) > rank(self) { other } else { self }
    }

    pub fn build_status(self) -> BuildStatus {
        match self {
            Outcome::Succeeded => BuildStatus::Succeeded,
            Outcome::Failed => BuildStatus::Failed,
            Outcome::Errored => BuildStatus::Errored,
            Outcome::Aborted => BuildStatus::Aborted,
        }
    }
}

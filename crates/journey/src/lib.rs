//! Journey orchestration — trigger-driven enrollment of contacts into
//! timed, multi-step email sequences, advanced by a clock-driven scheduler
//! with atomic claims, engagement conditions, and bounded retries.

pub mod enrollment;
pub mod ingress;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use enrollment::{EnrollmentManager, EnrollmentStore};
pub use ingress::EventIngress;
pub use registry::JourneyRegistry;
pub use scheduler::StepScheduler;

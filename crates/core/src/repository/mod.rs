pub mod agents;
pub mod groups;
pub mod jobs;
pub mod outbox;
pub mod participants;
pub mod quota;
pub mod scaling;
pub mod templates;

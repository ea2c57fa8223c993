pub mod attendance;
pub mod auth;
pub mod circulars;
pub mod core;
pub mod directory;
pub mod filters;
pub mod marks;
pub mod notes;
pub mod notifications;
pub mod profile;
pub mod setup;
pub mod timetable;

pub mod agent;
pub mod environments;
pub mod errors;
pub mod models;
pub mod prompt_template;
pub mod providers;
pub mod registry;
pub mod trajectory;

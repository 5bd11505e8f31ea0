pub mod invite_codes;
pub mod plans;
pub mod schema;
pub mod sessions;
pub mod turns;

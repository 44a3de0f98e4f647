pub mod events;
pub mod fence;
pub mod fhir;
pub mod models;
pub mod records;
pub mod runs;
pub mod text;
pub mod tools;

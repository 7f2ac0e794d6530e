pub mod bundled;
pub mod inspect;
pub mod install;

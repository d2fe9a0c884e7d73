// ABOUTME: Shared configuration surface for Metrodeck packages
// ABOUTME: Re-exports the environment variable name constants

pub mod constants;

pub use constants::*;

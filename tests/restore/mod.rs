//! Restore behaviour test modules.

mod bdd_steps;
mod scenarios;

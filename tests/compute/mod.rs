//! Provisioning behaviour exercised through the in-memory provider.

mod bdd_steps;
mod scenarios;
mod test_helpers;

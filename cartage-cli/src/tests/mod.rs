//! Shared test harness modules for the Cartage CLI.

use super::*;

mod steps;

//! Modpack CLI - package model files as OCI artifacts.

pub mod commands;
pub mod output;

// Configuration files and secret placeholders
pub mod config;

// Persisted per-configuration auth state
pub mod credentials;

// Authenticators and OAuth flow engines
pub mod auth;

// Per-invocation context
pub mod context;

// Command-line interface
pub mod cli;

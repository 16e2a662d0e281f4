//! Registry trait for config-named implementations.
//!
//! Endpoint and signer implementations are selected by name from the TOML
//! configuration. Each implementation module exposes a `Registry` struct that
//! ties that name to its factory function.

/// Base trait for implementation registries.
pub trait ImplementationRegistry {
	/// The name used in configuration files to select this implementation,
	/// for example `"http"` for `[endpoints] implementation = "http"`.
	const NAME: &'static str;

	/// The factory function type this implementation provides.
	type Factory;

	/// Returns the factory that builds this implementation from its config table.
	fn factory() -> Self::Factory;
}

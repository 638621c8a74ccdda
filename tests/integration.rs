// Integration test suite for the thrum daemon.
//
// Organized into focused modules: `invariants` covers the properties of
// §8 that must hold for all inputs, `scenarios` covers its literal
// input-to-effect examples. Both share `common::TestClient` for RPC-level
// tests against a real (HTTP-dispatched) Rocket instance, and reach into
// the library directly (`thrum_core::store`, `thrum_core::sync`, ...) where
// the property under test has no RPC surface of its own (sync ingest,
// sequence persistence across a process restart).

mod common;

mod invariants;
mod scenarios;

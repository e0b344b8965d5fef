// Aggregates all former standalone integration tests as modules.
mod repair_properties;
mod repair_scenarios;
mod write_path;

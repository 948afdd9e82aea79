mod gate_tests;
mod listener_tests;
mod savepoint_tests;

mod command_tests;
mod compile_tests;

/*
Unit tests that need access to crate internals live in this directory and
compile into the library crate under cfg(test).

See: https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 */

mod protocol_test;
mod translator_test;

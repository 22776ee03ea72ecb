//! Test suites for the runspace execution core.

mod support;

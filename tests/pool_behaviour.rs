//! Behavioural scenarios for running jobs through the worker pool.

mod pool;

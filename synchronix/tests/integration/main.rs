// Integration tests follow the organization suggested by Matklad:
// https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod blocking_ledger;
mod guarded_choice;
mod model_time;
mod rendezvous;
mod support;

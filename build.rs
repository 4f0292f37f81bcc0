fn main() {
    // Host builds (tests, proptest runs) have no IDF environment to forward.
    if std::env::var_os("CARGO_FEATURE_ESPIDF").is_some() {
        embuild::espidf::sysenv::output();
    }
}

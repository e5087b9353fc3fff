use lua_relay::cli::run_lua_relay;

fn main() {
    if let Err(err) = run_lua_relay() {
        tracing::error!(error = %err, "lua-relay failed");
        std::process::exit(1);
    }
}

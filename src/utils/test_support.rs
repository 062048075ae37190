/// Returns true when the current sandbox cannot open a loopback listener, in
/// which case mock-server tests bail out early instead of failing.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping mock-server test: loopback bind is not permitted");
            true
        }
        Err(err) => panic!("unexpected error binding loopback for mock-server tests: {err}"),
    }
}

use clap::{App, Arg};
use flint::session::SessionKey;
use std::fs;

/// Generates the cluster secret shared by the silo and every action server.
fn main() {
    let matches = App::new("Secret Generator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Generates the shared cluster secret file.")
        .arg(
            Arg::with_name("SECRET_FILE")
                .help("Path the secret will be written to")
                .required(true),
        )
        .get_matches();

    let path = matches.value_of("SECRET_FILE").unwrap();

    if fs::metadata(path).is_ok() {
        panic!("Refusing to overwrite existing secret file `{}`", path);
    }

    let secret = SessionKey::generate();
    let json = serde_json::json!({ "secret": base64_of(&secret) });

    fs::write(path, serde_json::to_string_pretty(&json).unwrap()).expect("Error writing secret file");

    println!("Wrote new cluster secret to `{}` (fingerprint {})", path, secret.fingerprint());
}

fn base64_of(secret: &SessionKey) -> String {
    // SessionKey serializes itself as base64; reuse that instead of a second encoder
    match serde_json::to_value(secret).unwrap() {
        serde_json::Value::String(encoded) => encoded,
        _ => unreachable!("Session keys serialize as strings"),
    }
}

use silo::config::SiloConfig;

fn main() {
    let config =
        serdeconv::to_toml_string(&SiloConfig::default()).expect("Failed to generate config file");

    println!("{}", config);
}

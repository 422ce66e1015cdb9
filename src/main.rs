fn main() {
    match kunai::run::run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("kunai: error: {}", err);
            std::process::exit(1);
        }
    }
}

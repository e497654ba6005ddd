fn main() {
    if let Err(err) = klartext_lib::run() {
        eprintln!("klartext: {err:#}");
        std::process::exit(1);
    }
}

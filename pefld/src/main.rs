fn main() {
    if let Err(error) = run() {
        libpefld::error::report_error_and_exit(&error);
    }
}

fn run() -> libpefld::error::Result {
    let linker = libpefld::Linker::from_args(std::env::args().skip(1))?;
    linker.run()
}

fn main() {
    use clap::Parser;
    use std::error::Error;
    let args = comicdl::cli::Args::parse();
    comicdl::logging::init(args.verbose, args.debug);
    if let Err(e) = comicdl::cli::run(&args) {
        eprintln!("{}", e);
        if args.verbose || args.debug {
            let mut source = e.source();
            while let Some(s) = source {
                eprintln!("  cause: {}", s);
                source = s.source();
            }
        }
        std::process::exit(e.exit_code());
    }
}

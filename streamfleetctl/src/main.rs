use clap::Parser;

fn main() {
    let cli = streamfleetctl::Cli::parse();
    if let Err(err) = streamfleetctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

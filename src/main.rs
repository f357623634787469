use anyhow::Context;
use rand_core::OsRng;
use structopt::StructOpt;
use threshold_keep::LocalSigner;
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt)]
#[structopt(name = "keep-signer", about = "Threshold ECDSA keep signer")]
enum Command {
    /// Generate a key pair, and sign a message with it.
    Sign {
        /// The message to sign, hashed with SHA-256.
        message: String,
    },
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Sign { message } => {
            let signer = LocalSigner::generate(OsRng).context("failed to generate key")?;
            let signature = signer
                .calculate_signature(OsRng, message.as_bytes())
                .context("failed to sign message")?;

            // Nothing is printed unless both steps succeeded.
            println!("--- Generated Public Key:\n{}", signer.public_key());
            println!("--- Signature:\n{}", signature);
            Ok(())
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Command::from_args()) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

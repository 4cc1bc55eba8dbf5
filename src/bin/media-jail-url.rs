//! Encode and decode media-jail URLs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use media_jail::signature::{self, Encoding};

#[derive(Parser)]
#[command(name = "media-jail-url")]
#[command(about = "Encode and decode media-jail proxy URLs")]
#[command(version)]
struct Args {
    /// HMAC key
    #[arg(short, long, env = "MEDIA_JAIL_KEY", hide_env_values = true)]
    key: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign a target URL
    Encode {
        /// Token alphabet
        #[arg(short, long, value_enum, default_value_t = Alphabet::Base64)]
        encoding: Alphabet,

        /// Proxy base URL to prefix, e.g. https://media.example.com
        #[arg(short, long)]
        prefix: Option<String>,

        /// Target URL
        url: String,
    },
    /// Verify a proxy URL or path and print its target
    Decode {
        /// Proxy URL, path or bare token
        url: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Alphabet {
    Base64,
    Hex,
}

impl From<Alphabet> for Encoding {
    fn from(a: Alphabet) -> Self {
        match a {
            Alphabet::Base64 => Encoding::Base64,
            Alphabet::Hex => Encoding::Hex,
        }
    }
}

/// Strip scheme and host from a full proxy URL, keeping the path.
fn token_of(input: &str) -> &str {
    match input.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |i| &rest[i..]),
        None => input,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let key = args.key.as_bytes();

    match args.command {
        Command::Encode {
            encoding,
            prefix,
            url,
        } => {
            let path = signature::encode_path(key, &url, encoding.into());
            let prefix = prefix.unwrap_or_default();
            println!("{}{}", prefix.trim_end_matches('/'), path);
        }
        Command::Decode { url } => {
            let target =
                signature::decode(key, token_of(&url)).context("token does not verify")?;
            println!("{}", target);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_of() {
        assert_eq!(token_of("https://media.example.com/abc/def"), "/abc/def");
        assert_eq!(token_of("/abc/def"), "/abc/def");
        assert_eq!(token_of("abc/def"), "abc/def");
        assert_eq!(token_of("https://media.example.com"), "");
    }
}

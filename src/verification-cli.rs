//! A simple CLI tool for checking a voter's receipt.
//! The commitment hash is recomputed with the same code the server uses, and
//! can optionally be looked up on a running server.

use std::fs::File;
use std::io::BufReader;

use clap::{Arg, ArgAction, ArgMatches, Command};
use rocket::serde::json::serde_json;
use votecommit::{Digest256, VoterReceipt};

use votecommit_backend::verification::{VerificationResult, VerificationStatus};

const PROGRAM_NAME: &str = "verify-receipt";

const ABOUT_TEXT: &str = "Verify a vote commitment receipt.

EXIT CODES:
     0: Verification succeeded.
   255: Ran successfully, but verification failed.
 Other: Error.";

const RECEIPT_PATH: &str = "RECEIPT_PATH";

const RECEIPT_PATH_HELP: &str = "The path to a receipt JSON file, containing \
`electionId`, `tokenId`, `selections`, `salt`, `timestampBucket` and `commitmentHash`";

const SERVER: &str = "server";

const SERVER_HELP: &str = "Base URL of a server to look the commitment up on, \
such as `https://vote.example.org`";

/// Construct the CLI configuration.
fn cli() -> Command {
    // Make the build dirty when the toml changes.
    include_str!("../Cargo.toml");

    clap::command!(PROGRAM_NAME)
        .about(ABOUT_TEXT)
        .arg(
            Arg::new(RECEIPT_PATH)
                .help(RECEIPT_PATH_HELP)
                .action(ArgAction::Set)
                .required(true),
        )
        .arg(
            Arg::new(SERVER)
                .long(SERVER)
                .help(SERVER_HELP)
                .action(ArgAction::Set),
        )
}

/// Errors that this program may produce.
#[derive(Debug, Eq, PartialEq)]
enum Error {
    /// IO error described by the inner message.
    IO(String),
    /// Failed to decode the receipt.
    Format(String),
    /// The server could not be queried.
    Server(String),
    /// The receipt does not match its own commitment hash.
    Mismatch {
        recorded: Digest256,
        recomputed: Digest256,
    },
    /// The server has no record of the commitment.
    NotRecorded,
}

/// Load a receipt and check it is internally consistent.
fn check_receipt(path: &str) -> Result<VoterReceipt, Error> {
    let file = BufReader::new(File::open(path).map_err(|e| Error::IO(e.to_string()))?);
    let receipt: VoterReceipt =
        serde_json::from_reader(file).map_err(|e| Error::Format(e.to_string()))?;

    let recomputed = receipt.recompute();
    if recomputed != receipt.commitment_hash {
        return Err(Error::Mismatch {
            recorded: receipt.commitment_hash,
            recomputed,
        });
    }
    Ok(receipt)
}

/// Ask a server what it knows about a commitment.
fn lookup(server: &str, hash: &Digest256) -> Result<VerificationResult, Error> {
    let url = format!("{}/verify", server.trim_end_matches('/'));
    let response = reqwest::blocking::Client::new()
        .get(url)
        .query(&[("hash", hash.to_hex())])
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::Server(e.to_string()))?;
    let result: VerificationResult = response.json().map_err(|e| Error::Server(e.to_string()))?;
    if result.found {
        Ok(result)
    } else {
        Err(Error::NotRecorded)
    }
}

fn describe(result: &VerificationResult) -> String {
    match result.status {
        VerificationStatus::Confirmed => format!(
            "anchored in block {} (transaction {})",
            result.fabric_block_num.unwrap_or_default(),
            result.fabric_tx_id.as_deref().unwrap_or("unknown")
        ),
        VerificationStatus::Pending => "recorded, not yet anchored".to_string(),
        VerificationStatus::DeadLettered => {
            "recorded, but anchoring failed; contact the election operator".to_string()
        }
        VerificationStatus::NotFound => "not found".to_string(),
    }
}

/// Run verification, report the result, and return the exit code.
fn run(args: &ArgMatches) -> u8 {
    let path: &String = args.get_one(RECEIPT_PATH).unwrap(); // Required argument is guaranteed to be present.
    let server: Option<&String> = args.get_one(SERVER);

    let outcome = check_receipt(path).and_then(|receipt| {
        println!(
            "Receipt is consistent: commitment {}.",
            receipt.commitment_hash
        );
        match server {
            Some(server) => lookup(server, &receipt.commitment_hash).map(Some),
            None => Ok(None),
        }
    });
    match outcome {
        Ok(None) => 0,
        Ok(Some(result)) => {
            println!("Server: {}.", describe(&result));
            0
        }
        Err(Error::IO(msg)) => {
            println!("IO error: {}", msg);
            1
        }
        Err(Error::Format(msg)) => {
            println!("Invalid receipt: {}", msg);
            1
        }
        Err(Error::Server(msg)) => {
            println!("Could not query server: {}", msg);
            1
        }
        Err(Error::Mismatch {
            recorded,
            recomputed,
        }) => {
            println!(
                "Verification failed: receipt records commitment {} but its contents give {}.",
                recorded, recomputed
            );
            255
        }
        Err(Error::NotRecorded) => {
            println!("Verification failed: the server has no record of this commitment.");
            255
        }
    }
}

fn main() {
    let args = cli().get_matches();
    let exit_code = run(&args);
    std::process::exit(exit_code.into())
}

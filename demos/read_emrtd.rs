use std::env;

use emrtd_verify::{
    bytes2hex, normalize, CancellationToken, EmrtdComms, EmrtdError, MrzRecord, MrzSeed,
    PassportReader, ReaderConfig, TravelDocumentRecord, TrustStore,
};
use tracing::{error, info, warn};

/// The MRZ from `MRZ`, or from `DOCNO`, `BIRTHDATE` and `EXPIRYDATE`.
fn seed_from_env() -> Option<MrzSeed> {
    if let Ok(mrz) = env::var("MRZ") {
        let record = normalize(&mrz).and_then(|mrz| MrzRecord::parse(&mrz));
        return match record.and_then(|record| record.bac_seed()) {
            Ok(seed) => Some(seed),
            Err(e) => {
                error!("MRZ is not usable: {e}");
                None
            }
        };
    }

    let (Ok(doc_no), Ok(birthdate), Ok(expirydate)) = (
        env::var("DOCNO"),
        env::var("BIRTHDATE"),
        env::var("EXPIRYDATE"),
    ) else {
        error!("Please set MRZ, or DOCNO, BIRTHDATE and EXPIRYDATE environment variables");
        return None;
    };
    match MrzSeed::new(&doc_no, &birthdate, &expirydate) {
        Ok(seed) => Some(seed),
        Err(e) => {
            error!("Invalid MRZ fields: {e}");
            None
        }
    }
}

fn main() -> Result<(), EmrtdError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let Some(seed) = seed_from_env() else {
        std::process::exit(1);
    };

    let config = match env::var("READER_CONFIG") {
        Ok(path) => match std::fs::read_to_string(&path) {
            Ok(json) => ReaderConfig::from_json(&json)?,
            Err(err) => {
                error!("Failed to read {path}: {err}");
                std::process::exit(1);
            }
        },
        Err(_) => ReaderConfig::default(),
    };

    // CSCA certificates, as a master list, a DER certificate or a PEM bundle.
    let mut trust_store = TrustStore::new();
    match env::var("CSCA") {
        Ok(path) => match std::fs::read(&path) {
            Ok(data) => {
                let added = trust_store.add_file_contents(&data)?;
                info!("{added} CSCA certificates loaded from {path}");
            }
            Err(err) => {
                error!("Failed to read {path}: {err}");
                std::process::exit(1);
            }
        },
        Err(_) => warn!("CSCA is not set, the document signer will not be chained"),
    }

    // Establish a PC/SC context.
    let ctx = match pcsc::Context::establish(pcsc::Scope::User) {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("Failed to establish context: {err}");
            std::process::exit(1);
        }
    };

    // List available readers.
    let mut readers_buf = [0; 2048];
    let mut readers = match ctx.list_readers(&mut readers_buf) {
        Ok(readers) => readers,
        Err(err) => {
            error!("Failed to list readers: {err}");
            std::process::exit(1);
        }
    };

    // Use the first reader.
    let reader = match readers.next() {
        Some(reader) => reader,
        None => {
            error!("No readers are connected.");
            std::process::exit(1);
        }
    };
    info!("Using reader: {reader:?}");

    // Connect to the card.
    let card = match ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
        Ok(card) => card,
        Err(pcsc::Error::NoSmartcard) => {
            error!("A smartcard is not present in the reader.");
            std::process::exit(1);
        }
        Err(err) => {
            error!("Failed to connect to card: {err}");
            std::process::exit(1);
        }
    };

    let mut comms = EmrtdComms::<pcsc::Card>::new(card);
    info!("ATR from attribute: {}", bytes2hex(&comms.get_atr()?));

    let outcome = PassportReader::new(config).read(
        &mut comms,
        &seed,
        &trust_store,
        &CancellationToken::new(),
    );
    if let Some(err) = &outcome.error {
        error!("Read stopped: {err}");
        if let Some(guidance) = err.guidance() {
            info!("{guidance}");
        }
    }

    let passport = outcome.passport;
    println!("{}", passport.verification);
    println!("{}", passport.to_json()?);

    if let Some(face) = &passport.face {
        let file = format!("face.{}", face.encoding.extension());
        match std::fs::write(&file, &face.data) {
            Ok(()) => info!("Face image written to {file}"),
            Err(err) => warn!("Failed to write {file}: {err}"),
        }
    }

    Ok(())
}

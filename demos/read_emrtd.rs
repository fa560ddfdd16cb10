use std::env;

use emrtd_tcl::{bytes2hex, data_groups_from_ef_com, DataGroup, EmrtdReader, Error, MrzInfo};
use tracing::{error, info, warn};

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    // MRZ data is only needed when the chip enforces BAC
    let mrz = match (
        env::var("DOCNO"),
        env::var("BIRTHDATE"),
        env::var("EXPIRYDATE"),
    ) {
        (Ok(doc_no), Ok(birthdate), Ok(expirydate)) => {
            Some(MrzInfo::new(&doc_no, &birthdate, &expirydate)?)
        }
        _ => {
            warn!("DOCNO, BIRTHDATE or EXPIRYDATE is not set, continuing without MRZ data");
            None
        }
    };

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
    let Some(reader) = readers.next() else {
        error!("No readers are connected.");
        std::process::exit(1);
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

    let mut emrtd = EmrtdReader::<pcsc::Card>::new(card);
    if emrtd.authenticate(mrz.as_ref())? {
        info!("Secure messaging session established");
    }

    // Read EF.COM
    let ef_com = emrtd.read_data_group(DataGroup::Com)?;
    info!("Data from the EF.COM: {}", bytes2hex(&ef_com));

    // Data group hashes to check every read against
    let sod = emrtd.read_security_object()?;
    info!("EF.SOD hash algorithm: {}", sod.hash_algorithm().name());

    for dg in data_groups_from_ef_com(&ef_com)? {
        if dg.requires_eac() {
            info!("Skipping {} ({}), EAC is required", dg.name(), dg.description());
            continue;
        }
        match emrtd.read_and_verify_data_group(dg, &sod) {
            Ok(data) => info!("Data from the {}: {}", dg.name(), bytes2hex(&data)),
            Err(err) => {
                error!("Failed to read {}: {err}", dg.name());
                return Err(err);
            }
        }
    }

    Ok(())
}

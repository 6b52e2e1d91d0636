use alleledb::config::Config;
use alleledb::registry::{AlleleRegistry, DocModification, GenomicDoc, VariantDoc};
use alleledb::variant::VariantCategory;
use alleledb::Error;
use std::env;
use std::path::Path;

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "alleledb.json".to_string());
    let smoke = args.any(|a| a == "--smoke");

    let config = if Path::new(&config_path).exists() {
        Config::from_file(Path::new(&config_path))?
    } else {
        println!("{} not found, using defaults in ./alleledb-data", config_path);
        let mut conf = Config::default_for(Path::new("./alleledb-data"));
        conf.reference_lengths = vec![250_000_000; 24];
        conf
    };

    let registry = AlleleRegistry::open(&config)?;
    println!("references: {}", registry.references().reference_count());
    println!("genomic variants: {}", registry.genomic_record_count()?);
    println!("protein variants: {}", registry.protein_record_count()?);
    println!("next CA/PA id: {}", registry.next_free_id());

    if smoke {
        // register one SNV and read it back through every path
        let mut doc = GenomicDoc::default();
        doc.modifications.push(DocModification {
            category: VariantCategory::NonShiftable,
            start: 1_000_000,
            region_length: 1,
            length_change: 0,
            inserted_sequence: "C".to_string(),
        });
        let mut docs = vec![VariantDoc::Genomic(doc)];
        registry.fetch_by_definition_and_add(&mut docs)?;
        let registered = docs[0].as_genomic().expect("just registered");
        println!("smoke: registered CA{}", registered.ca_id);

        let mut by_id = vec![VariantDoc::Genomic(GenomicDoc {
            ca_id: registered.ca_id,
            ..Default::default()
        })];
        registry.fetch_by_ca_pa_ids(&mut by_id)?;
        match &by_id[0] {
            VariantDoc::Genomic(doc) => {
                println!("smoke: CA{} -> position {}", doc.ca_id, doc.modifications[0].start)
            }
            other => println!("smoke: unexpected answer {:?}", other),
        }
    }

    Ok(())
}

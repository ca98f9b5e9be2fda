use anyhow::Result;
use itertools::Itertools;
use tracing_subscriber::EnvFilter;

use usb_link_model::{source, usb};

const TOP_LEVEL_SUBCOMMANDS: [&str; 4] = ["vcd", "usb::signal", "usb::packet", "usb::protocol"];

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut pipeline = Vec::new();

    for (sub_command, args) in std::env::args().skip(1).peekable().batching(|it| {
        it.next().map(|subcmd| {
            let mut args = it
                .peeking_take_while(|s| !TOP_LEVEL_SUBCOMMANDS.contains(&s.as_str()))
                .collect::<Vec<_>>();

            if it.peek().is_none() {
                args.push("-v".into());
            }
            (subcmd, args)
        })
    }) {
        match sub_command.as_str() {
            "vcd" => source::vcd::build(&mut pipeline, &args)?,
            "usb::signal" => usb::signal::build(&mut pipeline, &args)?,
            "usb::packet" => usb::packet::build(&mut pipeline, &args)?,
            "usb::protocol" => usb::protocol::build(&mut pipeline, &args)?,
            other => anyhow::bail!(
                "Unknown stage {:?}, expected one of {}",
                other,
                TOP_LEVEL_SUBCOMMANDS.iter().join(", ")
            ),
        }
    }

    anyhow::ensure!(
        pipeline.len() == 1,
        "The pipeline should resolve to a single iterator"
    );
    colored::control::set_override(true);
    if let Some(event_iterator) = pipeline.pop() {
        event_iterator.for_each(|_| {});
    }

    Ok(())
}

use clap::Args;

use super::NetArgs;

#[derive(Args)]
pub struct CheckArgs {
    #[command(flatten)]
    pub net: NetArgs,
}

pub fn cmd_check(args: CheckArgs) {
    let loaded = args.net.load();
    let template = loaded.plan.template();
    let report = template.report();
    eprintln!(
        "OK: {} ({} layers, length: {:?}, {} refinement passes)",
        loaded.filename,
        template.layers().count(),
        template.length_mode(),
        report.refinement_passes
    );
    for layer in &report.best_effort {
        eprintln!("note: '{}' kept a best-effort descriptor", layer);
    }
    for info in template.layers() {
        println!("{:<16} {:<10} {}", info.name, info.spec.class, info.desc);
    }
}

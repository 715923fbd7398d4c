use clap::Args;

use super::NetArgs;

#[derive(Args)]
pub struct PartitionArgs {
    #[command(flatten)]
    pub net: NetArgs,
    /// Print the partition as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn cmd_partition(args: PartitionArgs) {
    let loaded = args.net.load();
    let partition = loaded.plan.partition();
    if args.json {
        match serde_json::to_string_pretty(partition) {
            Ok(text) => println!("{}", text),
            Err(e) => super::fail(&e.to_string()),
        }
    } else {
        print!("{}", partition.report());
    }
}

use clap::Args;

use recnet::{ParamStore, RecInputs};

use super::{Backend, NetArgs};

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub net: NetArgs,
    /// Batch entries
    #[arg(long, default_value_t = 2)]
    pub batch: usize,
    /// Frames of every extern data sequence
    #[arg(long, default_value_t = 5)]
    pub steps: usize,
    /// Collapse beams to the best hypothesis before printing
    #[arg(long)]
    pub decide: bool,
}

pub fn cmd_run(args: RunArgs) {
    let loaded = args.net.load();
    let device = Default::default();
    let inputs = RecInputs::<Backend>::zeros(&loaded.env, args.batch, args.steps, &device);
    let mut params = ParamStore::new(&device);

    let out = match loaded.plan.run(&loaded.registry, &inputs, &mut params) {
        Ok(out) => out,
        Err(e) => super::fail(&e.to_string()),
    };
    let out = if args.decide {
        out.decide(false)
    } else {
        out
    };

    println!("steps: {}", out.steps);
    println!("beam:  {}", out.beam_size);
    println!("seq_lens: {:?}", out.seq_lens);
    for (name, value) in &out.outputs {
        println!("{:<16} {:?}", name, value.shape());
    }
    if !out.search.is_empty() {
        println!("scores: {:?}", out.scores);
    }
    for (name, loss) in &out.losses {
        println!(
            "loss {:<11} {} total {:.4} over {} frames",
            name,
            loss.kind.name(),
            loss.total,
            loss.frames
        );
    }
}

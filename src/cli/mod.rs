pub mod check;
pub mod partition;
pub mod run;

use std::path::{Path, PathBuf};
use std::process;

use burn::backend::NdArray;
use clap::Args;
use recnet::diagnostic::Severity;
use recnet::{
    BuildError, Diagnostic, LayerRegistry, NetDict, OutputDesc, RecLayer, RecOptions, RecPlan,
    TemplateEnv,
};

pub type Backend = NdArray;

/// Arguments shared by every subcommand.
#[derive(Args, Clone, Debug)]
pub struct NetArgs {
    /// Net definition (JSON, layer name → layer object)
    pub net: PathBuf,
    /// Rec options (JSON)
    #[arg(long, value_name = "PATH")]
    pub options: Option<PathBuf>,
    /// Extern data descriptor, `key=dim` or `key=dim:sparse` (repeatable)
    #[arg(long = "data", value_name = "KEY=DIM[:sparse]", value_parser = parse_desc)]
    pub data: Vec<(String, OutputDesc)>,
    /// Outer-scope layer descriptor, same syntax as --data (repeatable)
    #[arg(long = "base", value_name = "NAME=DIM[:sparse]", value_parser = parse_desc)]
    pub base: Vec<(String, OutputDesc)>,
    /// Enable beam search
    #[arg(long)]
    pub search: bool,
    /// Keep every layer inside the loop
    #[arg(long)]
    pub no_hoist: bool,
}

/// A built plan with everything needed to report on it.
pub struct Loaded {
    pub plan: RecPlan,
    pub env: TemplateEnv,
    pub registry: LayerRegistry<Backend>,
    pub filename: String,
}

impl NetArgs {
    fn env(&self) -> TemplateEnv {
        let mut env = TemplateEnv::new();
        for (key, desc) in &self.data {
            env = env.with_data(key, desc.clone());
        }
        for (name, desc) in &self.base {
            env = env.with_base(name, desc.clone());
        }
        env
    }

    fn rec_options(&self) -> RecOptions {
        let mut options = match &self.options {
            Some(path) => match read(path).and_then(|text| {
                RecOptions::from_json(&text).map_err(|e| e.to_string())
            }) {
                Ok(options) => options,
                Err(e) => fail(&format!("cannot load options '{}': {}", path.display(), e)),
            },
            None => RecOptions::default(),
        };
        if self.search {
            options = options.with_search(true);
        }
        if self.no_hoist {
            options = options.with_hoisting(false);
        }
        options
    }

    /// Load and build; diagnostics are rendered and the process exits on
    /// failure.
    pub fn load(&self) -> Loaded {
        let filename = self.net.display().to_string();
        let source = match read(&self.net) {
            Ok(text) => text,
            Err(e) => fail(&format!("cannot read '{}': {}", filename, e)),
        };
        let net = match NetDict::from_json(&source) {
            Ok(net) => net,
            Err(e) => report_and_exit(&e, &filename, &source),
        };
        let env = self.env();
        let registry = LayerRegistry::<Backend>::with_builtins();
        let plan = match RecLayer::new(net, self.rec_options()).build(&registry, &env) {
            Ok(plan) => plan,
            Err(e) => report_and_exit(&e, &filename, &source),
        };
        for recovered in &plan.template().report().recovered {
            let mut diag = Diagnostic::from(recovered);
            diag.severity = Severity::Warning;
            let _ = diag.render(&filename, &source);
        }
        Loaded {
            plan,
            env,
            registry,
            filename,
        }
    }
}

fn read(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path).map_err(|e| e.to_string())
}

fn report_and_exit(err: &BuildError, filename: &str, source: &str) -> ! {
    if Diagnostic::from(err).render(filename, source).is_err() {
        eprintln!("error: {}", err);
    }
    process::exit(1);
}

fn fail(message: &str) -> ! {
    eprintln!("error: {}", message);
    process::exit(1);
}

/// `key=dim` or `key=dim:sparse`.
fn parse_desc(arg: &str) -> Result<(String, OutputDesc), String> {
    let (key, rest) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=DIM[:sparse], got '{}'", arg))?;
    if key.is_empty() {
        return Err("empty key".to_string());
    }
    let (dim, sparse) = match rest.strip_suffix(":sparse") {
        Some(dim) => (dim, true),
        None => (rest, false),
    };
    let dim: usize = dim
        .parse()
        .map_err(|_| format!("'{}' is not a dimension", dim))?;
    let desc = if sparse {
        OutputDesc::sparse(dim)
    } else {
        OutputDesc::dense(dim)
    };
    Ok((key.to_string(), desc))
}

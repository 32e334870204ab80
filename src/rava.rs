use clap::Parser;
use rsvm_linker::{
    object::ClassStatus,
    vm::{VMConfig, VM},
};

#[derive(Parser, Debug)]
#[command(version, about = "Locate or generate compiled artifacts for dex files", long_about = None)]
struct Cli {
    /// Boot class path handed to the compiler, colon separated
    #[arg(long)]
    boot_class_path: Option<String>,

    /// Directory holding generated artifacts
    #[arg(long)]
    dalvik_cache: Option<String>,

    /// Compiler executable used for missing or stale artifacts
    #[arg(long)]
    compiler: Option<String>,

    /// Instruction set of the artifacts
    #[arg(long)]
    isa: Option<String>,

    /// Boot image the artifacts are compiled against
    #[arg(long)]
    image: Option<String>,

    /// Extra compiler option, may be repeated
    #[arg(short = 'X', long = "compiler-option")]
    compiler_options: Vec<String>,

    /// Skip bytecode verification when compiling
    #[arg(long)]
    no_verify: bool,

    /// Dex file locations
    #[arg(required = true)]
    dex_files: Vec<String>,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let mut cfg = VMConfig::default();
    if let Some(bcp) = &cli.boot_class_path {
        cfg.set_boot_class_path(bcp);
    }
    if let Some(cache) = &cli.dalvik_cache {
        cfg.set_dalvik_cache(cache);
    }
    if let Some(compiler) = &cli.compiler {
        cfg.set_compiler(compiler);
    }
    if let Some(isa) = &cli.isa {
        cfg.set_instruction_set(isa);
    }
    if let Some(image) = &cli.image {
        cfg.set_image(image);
    }
    for option in cli.compiler_options.iter() {
        cfg.add_compiler_option(option);
    }
    cfg.set_verification(!cli.no_verify);

    let vm = match VM::new(&cfg) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("rava-link: {}", e);
            std::process::exit(2);
        }
    };

    let mut failed = false;
    for dex_location in cli.dex_files.iter() {
        match vm.find_artifact(dex_location) {
            Ok(found) => {
                let oat_dex_file = found.oat_dex_file();
                let verified = (0..oat_dex_file.num_classes())
                    .filter_map(|i| oat_dex_file.oat_class(i as u16))
                    .filter(|c| matches!(c.status(), ClassStatus::Verified | ClassStatus::Initialized))
                    .count();
                println!(
                    "{} -> {} ({} classes, {} verified)",
                    dex_location,
                    found.oat_file().location(),
                    oat_dex_file.num_classes(),
                    verified
                );
            }
            Err(e) => {
                eprintln!("{}: {}", dex_location, e);
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
}

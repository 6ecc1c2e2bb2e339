use modelport::args::CliArgs;
use modelport::pipeline;
use structopt::StructOpt;

fn main() {
    let args = CliArgs::from_args();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_level())).init();

    match pipeline::run(&args.model_dir, &args.pipeline_config()) {
        Ok(report) => println!("Model converted to {}", report.packaged.path().display()),
        Err(e) => {
            log::error!("{e:?}");
            std::process::exit(1)
        }
    }
}

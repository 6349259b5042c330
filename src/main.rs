use provisioner::{cli, logging, run, ProvisionError};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if err
                .downcast_ref::<ProvisionError>()
                .is_some_and(ProvisionError::is_not_found)
            {
                eprintln!("provisioner: {err} (session expired, start over with `provisioner new`)");
            } else {
                eprintln!("provisioner error: {err:?}");
            }
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<i32> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    run(args).await
}

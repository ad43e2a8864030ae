use std::process::ExitCode;

fn main() -> ExitCode {
    gsm_orchestrator_lib::run()
}

// Model worker process. Spawned by the host controller with
// `<model_path> <config_json>`; speaks JSON Lines on stdin/stdout.

fn main() {
    std::process::exit(model_host_worker::run_worker());
}

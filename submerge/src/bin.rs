// Process entry point. Illustrative only: wiring a real peer together
// (hub, net-tables, transactions) is a deployment concern outside this
// spec's scope; this just installs logging and drops into the TUI.

fn main() {
    submerge_admin::init_tracing().ok();
    if let Err(e) = submerge_ui::run_ui() {
        eprintln!("submerge: {e}");
        std::process::exit(1);
    }
}

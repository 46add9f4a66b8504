fn main() -> anyhow::Result<()> {
    spdc_supervisor_lib::run()
}

fn main() -> snappatch::anyhow::Result<()> {
    snappatch::patcher_main()
}

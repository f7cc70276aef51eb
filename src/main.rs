fn main() -> vibe_mqtt::Result<()> {
    vibe_mqtt::cli::main()
}

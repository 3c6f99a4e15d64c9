//! Greets players and reports on the server it runs in.

#[require_module(Permissions)]
#[derive(Default)]
pub struct Greeter {
    #[module_ref]
    pub Permissions: ModuleRef,
    greeted: u32,
    server: Option<ServerHandle>,
}

impl ServerModule for Greeter {
    fn on_creating_server_instance(&mut self, server: &ServerHandle) {
        self.server = Some(server.clone());
    }
}

impl Greeter {
    #[command("greet", description = "Greets a player")]
    fn greet(&mut self, #[default("traveller")] name: String, #[default(1)] times: u8) -> String {
        self.greeted += 1;
        vec![format!("Welcome, {}!", name); times as usize].join("\n")
    }

    #[command("server info", description = "Shows the server this module is attached to")]
    fn server_info(&self) -> String {
        match &self.server {
            Some(server) => format!(
                "{} on {} ({} greetings, permissions loaded: {})",
                server.name,
                server.bind_address,
                self.greeted,
                self.Permissions.is_loaded()
            ),
            None => "No server yet".to_string(),
        }
    }
}

pub mod guild_configs;

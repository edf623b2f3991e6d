#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    /// Key the argument is stored under in `command_args`/`settings_update`.
    pub key: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "style",
        action: "set_style",
        key: "style",
    },
    CommandSpec {
        command: "notes",
        action: "set_notes",
        key: "notes",
    },
    CommandSpec {
        command: "negative",
        action: "set_negative",
        key: "negative_prompt",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "geometry",
        action: "set_geometry",
        key: "path",
    },
    CommandSpec {
        command: "reference",
        action: "set_reference",
        key: "path",
    },
    CommandSpec {
        command: "save",
        action: "save_render",
        key: "path",
    },
];

pub(crate) const INTEGER_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "resolution",
        action: "set_render_param",
        key: "resolution",
    },
    CommandSpec {
        command: "steps",
        action: "set_render_param",
        key: "steps",
    },
];

pub(crate) const FLOAT_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "scale",
    action: "set_render_param",
    key: "guidance_scale",
}];

pub(crate) const TOGGLE_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "clean",
    action: "set_clean",
    key: "clean_background",
}];

pub(crate) const MODELS_COMMAND: CommandSpec = CommandSpec {
    command: "models",
    action: "set_models",
    key: "models",
};

pub(crate) const NO_ARG_COMMANDS: &[&str] = &[
    "analyze",
    "render",
    "discover",
    "show",
    "styles",
    "clear_reference",
    "help",
];

pub const STUDIO_HELP_COMMANDS: &[&str] = &[
    "/geometry",
    "/reference",
    "/clear_reference",
    "/style",
    "/styles",
    "/notes",
    "/clean",
    "/models",
    "/discover",
    "/analyze",
    "/negative",
    "/resolution",
    "/scale",
    "/steps",
    "/render",
    "/save",
    "/show",
    "/help",
];

use iocraft::prelude::*;
use tokio::sync::watch;

#[derive(Default, Props)]
pub struct SuccessMessageProps {
    pub message: String,
}

#[component]
pub fn SuccessMessage(props: &SuccessMessageProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Row) {
            Text(color: Color::Green, content: "◆ ")
            Text(weight: Weight::Bold, content: &props.message)
        }
    }
}

#[derive(Default, Props)]
pub struct ErrorMessageProps {
    pub message: String,
    /// Causes, outermost first.
    pub causes: Vec<String>,
}

#[component]
pub fn ErrorMessage(props: &ErrorMessageProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Column) {
            View(flex_direction: FlexDirection::Row) {
                Text(color: Color::Red, content: "▲ ")
                Text(weight: Weight::Bold, content: &props.message)
            }
            #(props.causes.iter().map(|cause| element! {
                Text(color: Color::DarkGrey, content: format!("│ caused by: {}", cause))
            }))
        }
    }
}

#[derive(Default, Props)]
pub struct UploadSummaryProps {
    pub location: String,
    pub upload_id: Option<String>,
    pub e_tag: Option<String>,
    pub bytes: u64,
    /// Part number and entity tag, in completion order.
    pub parts: Vec<(u32, String)>,
}

#[component]
pub fn UploadSummary(props: &UploadSummaryProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Column) {
            View(flex_direction: FlexDirection::Row) {
                Text(content: "┌ ")
                View(background_color: Color::Blue) {
                    Text(content: &props.location, color: Color::White)
                }
            }
            Text(content: format!(
                "│ upload id: {}",
                props.upload_id.as_deref().unwrap_or("<single-shot>")
            ))
            #(props.parts.iter().map(|(number, e_tag)| element! {
                Text(content: format!("│ part {:>5}  {}", number, e_tag))
            }))
            Text(content: format!(
                "└ {} bytes, etag {}",
                props.bytes,
                props.e_tag.as_deref().unwrap_or("<none>")
            ))
        }
    }
}

#[derive(Default, Props)]
pub struct ProgressBarProps {
    pub title: String,
    pub progress: Option<watch::Receiver<f32>>,
}

#[component]
pub fn ProgressBar(props: &ProgressBarProps, mut hooks: Hooks) -> impl Into<AnyElement<'static>> {
    let mut percent = hooks.use_state(|| 0.0f32);
    let receiver = props.progress.clone();

    hooks.use_future(async move {
        let Some(mut receiver) = receiver else {
            return;
        };
        while receiver.changed().await.is_ok() {
            let value = *receiver.borrow_and_update();
            percent.set(value.clamp(0.0, 100.0));
        }
    });

    element! {
        View(flex_direction: FlexDirection::Column) {
            Text(weight: Weight::Bold, content: &props.title)
            View(flex_direction: FlexDirection::Row) {
                View(border_style: BorderStyle::Round, border_color: Color::Blue, width: 42) {
                    View(width: Percent(percent.get()), height: 1, background_color: Color::Green)
                }
                View(padding: 1) {
                    Text(content: format!("{:.0}%", percent.get()))
                }
            }
        }
    }
}

#[derive(Default, Props)]
pub struct ConfigRowsProps {
    pub title: String,
    pub rows: Vec<(String, String)>,
}

#[component]
pub fn ConfigRows(props: &ConfigRowsProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Column) {
            Text(weight: Weight::Bold, color: Color::Cyan, content: &props.title)
            #(props.rows.iter().map(|(name, value)| element! {
                View(flex_direction: FlexDirection::Row) {
                    View(width: 20) {
                        Text(content: name.clone())
                    }
                    Text(content: value.clone())
                }
            }))
        }
    }
}

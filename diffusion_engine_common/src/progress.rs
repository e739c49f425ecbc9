use indicatif::{ProgressBar, ProgressBarIter, ProgressDrawTarget, ProgressIterator, ProgressStyle};

/// Progress bar over an iterator of known length. The const parameter picks the bar color:
/// `'g'` green, `'r'` red, anything else blue.
pub struct NiceProgressBar<'a, T: ExactSizeIterator, const COLOR: char = 'b'>(pub T, pub &'a str);

impl<T: ExactSizeIterator, const COLOR: char> IntoIterator for NiceProgressBar<'_, T, COLOR> {
    type IntoIter = ProgressBarIter<T>;
    type Item = T::Item;

    fn into_iter(self) -> Self::IntoIter {
        let color = match COLOR {
            'g' => "green",
            'r' => "red",
            _ => "blue",
        };

        let bar = ProgressBar::new(self.0.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{{msg}} [{{elapsed_precise}}] [{{bar:40.{color}/{color}}}] {{pos}}/{{len}} ({{eta}})"
                ))
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_message(self.1.to_string());
        self.0.progress_with(bar)
    }
}

/// Show a progress bar over an iterator unless `silent` is set.
pub trait IterWithProgress<'a, T>: Iterator<Item = T> + 'a {
    fn with_progress(self, silent: bool) -> Box<dyn Iterator<Item = T> + 'a>
    where
        Self: Sized + ExactSizeIterator,
    {
        if silent {
            Box::new(self)
        } else {
            let bar = ProgressBar::new(self.len() as u64);
            bar.set_draw_target(ProgressDrawTarget::stderr());
            Box::new(self.progress_with(bar))
        }
    }
}

impl<'a, T: Iterator + 'a> IterWithProgress<'a, T::Item> for T {}

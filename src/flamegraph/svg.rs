use std::borrow::Cow;
use std::io::prelude::*;

use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use str_stack::StrStack;

use super::color;
use super::Options;

pub(super) enum TextArgument<'a> {
    String(Cow<'a, str>),
    FromBuffer(usize),
}

impl<'a> From<&'a str> for TextArgument<'a> {
    fn from(s: &'a str) -> Self {
        TextArgument::String(Cow::from(s))
    }
}

impl<'a> From<String> for TextArgument<'a> {
    fn from(s: String) -> Self {
        TextArgument::String(Cow::from(s))
    }
}

impl<'a> From<usize> for TextArgument<'a> {
    fn from(i: usize) -> Self {
        TextArgument::FromBuffer(i)
    }
}

pub(super) struct TextItem<'a, I> {
    pub(super) x: f64,
    pub(super) y: f64,
    pub(super) text: TextArgument<'a>,
    pub(super) extra: I,
}

pub(super) fn write_header<W>(
    svg: &mut Writer<W>,
    imageheight: usize,
    opt: &Options,
) -> quick_xml::Result<()>
where
    W: Write,
{
    svg.write_event(Event::Decl(BytesDecl::new("1.0", None, Some("no"))))?;
    svg.write_event(Event::DocType(BytesText::from_escaped(
        r#" svg PUBLIC "-//W3C//DTD SVG 1.1//EN" "http://www.w3.org/Graphics/SVG/1.1/DTD/svg11.dtd""#,
    )))?;
    let width = opt.image_width.to_string();
    let height = imageheight.to_string();
    let view_box = format!("0 0 {} {}", opt.image_width, imageheight);
    svg.write_event(Event::Start(BytesStart::new("svg").with_attributes([
        ("version", "1.1"),
        ("width", width.as_str()),
        ("height", height.as_str()),
        ("viewBox", view_box.as_str()),
        ("xmlns", "http://www.w3.org/2000/svg"),
        ("xmlns:xlink", "http://www.w3.org/1999/xlink"),
    ])))?;
    svg.write_event(Event::Comment(BytesText::from_escaped(
        "Flame graph of stacks merged from all ranks. Hover over a frame to see its full \
         stack path and sample counts.",
    )))?;
    Ok(())
}

pub(super) fn write_prelude<W>(
    svg: &mut Writer<W>,
    imageheight: usize,
    opt: &Options,
) -> quick_xml::Result<()>
where
    W: Write,
{
    let (bgcolor1, bgcolor2) = color::bgcolor_for(opt.colors);

    svg.write_event(Event::Start(BytesStart::new("defs")))?;
    svg.write_event(Event::Start(BytesStart::new("linearGradient").with_attributes([
        ("id", "background"),
        ("y1", "0"),
        ("y2", "1"),
        ("x1", "0"),
        ("x2", "0"),
    ])))?;
    svg.write_event(Event::Empty(
        BytesStart::new("stop").with_attributes([("stop-color", bgcolor1), ("offset", "5%")]),
    ))?;
    svg.write_event(Event::Empty(
        BytesStart::new("stop").with_attributes([("stop-color", bgcolor2), ("offset", "95%")]),
    ))?;
    svg.write_event(Event::End(BytesEnd::new("linearGradient")))?;
    svg.write_event(Event::End(BytesEnd::new("defs")))?;

    svg.write_event(Event::Start(
        BytesStart::new("style").with_attributes([("type", "text/css")]),
    ))?;
    svg.write_event(Event::Text(BytesText::new(&format!(
        "text {{ font-family:Verdana; font-size:{}px; fill:rgb(0,0,0); }}\n\
         #title {{ text-anchor:middle; font-size:{}px; }}\n\
         .func_g:hover {{ stroke:black; stroke-width:0.5; cursor:pointer; }}",
        opt.font_size,
        opt.font_size + 5,
    ))))?;
    svg.write_event(Event::End(BytesEnd::new("style")))?;

    let width = opt.image_width.to_string();
    let height = imageheight.to_string();
    svg.write_event(Event::Empty(BytesStart::new("rect").with_attributes([
        ("x", "0"),
        ("y", "0"),
        ("width", width.as_str()),
        ("height", height.as_str()),
        ("fill", "url(#background)"),
    ])))?;

    // We don't care too much about allocating just for the prelude
    let mut buf = StrStack::new();
    write_str(
        svg,
        &mut buf,
        TextItem {
            x: (opt.image_width / 2) as f64,
            y: (opt.font_size * 2) as f64,
            text: opt.title.as_str().into(),
            extra: [("id", "title")],
        },
    )?;

    Ok(())
}

pub(super) fn write_str<'a, W, I>(
    svg: &mut Writer<W>,
    buf: &mut StrStack,
    item: TextItem<'a, I>,
) -> quick_xml::Result<()>
where
    W: Write,
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let x = write!(buf, "{:.2}", item.x);
    let y = write!(buf, "{:.2}", item.y);
    let mut text = BytesStart::new("text").with_attributes(item.extra);
    text.push_attribute(Attribute::from(("x", &buf[x])));
    text.push_attribute(Attribute::from(("y", &buf[y])));
    svg.write_event(Event::Start(text))?;
    let s = match item.text {
        TextArgument::String(ref s) => &**s,
        TextArgument::FromBuffer(i) => &buf[i],
    };
    svg.write_event(Event::Text(BytesText::new(s)))?;
    svg.write_event(Event::End(BytesEnd::new("text")))?;
    Ok(())
}
